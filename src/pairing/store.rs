use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::PairedClient;
use crate::error::{AppError, Result};
use crate::utils::atomic_replace;

/// Persisted store of paired clients.
///
/// The on-disk form is a JSON array; the file is replaced atomically on
/// every mutation so a crash never leaves a half-written pairing file.
#[derive(Clone)]
pub struct NamedCertStore {
    path: PathBuf,
    clients: Arc<RwLock<Vec<PairedClient>>>,
}

impl NamedCertStore {
    pub async fn load(path: &Path) -> Result<Self> {
        let clients = match tokio::fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| AppError::Parse(format!("paired-client store: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            clients: Arc::new(RwLock::new(clients)),
        })
    }

    /// Snapshot of all paired clients.
    pub async fn list(&self) -> Vec<PairedClient> {
        self.clients.read().await.clone()
    }

    pub async fn find_by_uuid(&self, uuid: &str) -> Option<PairedClient> {
        self.clients
            .read()
            .await
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
    }

    /// The certificate is the identity: look a client up by its PEM.
    pub async fn find_by_cert(&self, cert_pem: &str) -> Option<PairedClient> {
        self.clients
            .read()
            .await
            .iter()
            .find(|c| c.cert_pem == cert_pem)
            .cloned()
    }

    /// Add a freshly paired client. An existing entry with the same
    /// certificate is replaced rather than duplicated.
    pub async fn add(&self, mut client: PairedClient) -> Result<PairedClient> {
        if client.uuid.is_empty() {
            client.uuid = Uuid::new_v4().to_string();
        }

        let snapshot = {
            let mut clients = self.clients.write().await;
            clients.retain(|c| c.cert_pem != client.cert_pem);
            clients.push(client.clone());
            clients.clone()
        };
        self.persist(&snapshot).await?;
        Ok(client)
    }

    /// Merge updated per-client settings by uuid.
    pub async fn update<F>(&self, uuid: &str, f: F) -> Result<PairedClient>
    where
        F: FnOnce(&mut PairedClient),
    {
        let snapshot = {
            let mut clients = self.clients.write().await;
            let client = clients
                .iter_mut()
                .find(|c| c.uuid == uuid)
                .ok_or_else(|| AppError::NotFound(format!("client {uuid}")))?;
            f(client);
            clients.clone()
        };
        self.persist(&snapshot).await?;
        Ok(snapshot.iter().find(|c| c.uuid == uuid).cloned().unwrap())
    }

    /// Remove one client. Returns whether anything was removed.
    pub async fn remove(&self, uuid: &str) -> Result<bool> {
        let (snapshot, removed) = {
            let mut clients = self.clients.write().await;
            let before = clients.len();
            clients.retain(|c| c.uuid != uuid);
            (clients.clone(), clients.len() != before)
        };
        if removed {
            self.persist(&snapshot).await?;
        }
        Ok(removed)
    }

    pub async fn remove_all(&self) -> Result<()> {
        {
            let mut clients = self.clients.write().await;
            clients.clear();
        }
        self.persist(&[]).await
    }

    async fn persist(&self, clients: &[PairedClient]) -> Result<()> {
        let json = serde_json::to_vec_pretty(clients)?;
        atomic_replace(&self.path, &json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn client(name: &str, cert: &str) -> PairedClient {
        PairedClient {
            name: name.to_string(),
            cert_pem: cert.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_assigns_uuid_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("named_certs.json");

        let store = NamedCertStore::load(&path).await.unwrap();
        let added = store.add(client("laptop", "CERT-A")).await.unwrap();
        assert!(!added.uuid.is_empty());

        let reloaded = NamedCertStore::load(&path).await.unwrap();
        assert_eq!(reloaded.list().await.len(), 1);
        assert_eq!(reloaded.find_by_cert("CERT-A").await.unwrap().name, "laptop");
    }

    #[tokio::test]
    async fn same_cert_replaces_existing_entry() {
        let dir = tempdir().unwrap();
        let store = NamedCertStore::load(&dir.path().join("nc.json"))
            .await
            .unwrap();

        store.add(client("old-name", "CERT-A")).await.unwrap();
        store.add(client("new-name", "CERT-A")).await.unwrap();

        let clients = store.list().await;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "new-name");
    }

    #[tokio::test]
    async fn update_and_remove() {
        let dir = tempdir().unwrap();
        let store = NamedCertStore::load(&dir.path().join("nc.json"))
            .await
            .unwrap();

        let added = store.add(client("pc", "CERT-B")).await.unwrap();
        store
            .update(&added.uuid, |c| c.always_use_virtual_display = true)
            .await
            .unwrap();
        assert!(
            store
                .find_by_uuid(&added.uuid)
                .await
                .unwrap()
                .always_use_virtual_display
        );

        assert!(store.remove(&added.uuid).await.unwrap());
        assert!(!store.remove(&added.uuid).await.unwrap());
    }
}
