//! Filesystem helpers.

use std::io;
use std::path::Path;

/// Replace the contents of `path` atomically.
///
/// The data is written to a sibling temp file and renamed over the target so
/// readers never observe a partially written file. The persisted stores
/// (apps.json, paired clients, token files) all go through this.
pub async fn atomic_replace(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn replace_creates_and_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");

        atomic_replace(&path, b"first").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"first");

        atomic_replace(&path, b"second").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");
    }
}
