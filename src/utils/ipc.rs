//! Framed IPC primitives shared by the display and capture helper clients.
//!
//! All helper protocols use the same outer framing: a little-endian `u32`
//! payload length, one `u8` message type, then the payload. The transport is
//! a named duplex pipe on Windows and a Unix domain socket elsewhere; both
//! are addressed by a bare pipe name.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Upper bound on a single frame payload. Apply payloads carry a topology
/// snapshot as JSON and stay far below this.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcFrame {
    pub kind: u8,
    pub payload: Bytes,
}

/// Pure frame encode/decode. The async read/write paths and the unit tests
/// share these so the byte layout is pinned in exactly one place.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame: `u32 LE length | u8 type | payload`.
    pub fn encode(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.push(kind);
        buf.extend_from_slice(payload);
        buf
    }

    /// Decode one frame from the front of `buf`, returning the frame and the
    /// number of bytes consumed, or `None` if the buffer is incomplete.
    pub fn decode(buf: &[u8]) -> io::Result<Option<(IpcFrame, usize)>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {} exceeds cap", len),
            ));
        }
        let total = 5 + len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let frame = IpcFrame {
            kind: buf[4],
            payload: Bytes::copy_from_slice(&buf[5..total]),
        };
        Ok(Some((frame, total)))
    }
}

/// Write one frame to an async stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: u8,
    payload: &[u8],
) -> io::Result<()> {
    let buf = FrameCodec::encode(kind, payload);
    w.write_all(&buf).await?;
    w.flush().await
}

/// Read one frame from an async stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<IpcFrame> {
    let mut header = [0u8; 5];
    r.read_exact(&mut header).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds cap", len),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(IpcFrame {
        kind: header[4],
        payload: Bytes::from(payload),
    })
}

/// Resolve a bare pipe name to its OS-level address.
#[cfg(unix)]
fn pipe_path(name: &str) -> PathBuf {
    let runtime = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    runtime.join(format!("{name}.sock"))
}

#[cfg(windows)]
fn pipe_path(name: &str) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{name}"))
}

/// A connected duplex IPC stream.
#[cfg(unix)]
pub struct IpcStream(tokio::net::UnixStream);

#[cfg(windows)]
pub enum IpcStream {
    Client(tokio::net::windows::named_pipe::NamedPipeClient),
    Server(tokio::net::windows::named_pipe::NamedPipeServer),
}

impl IpcStream {
    /// Connect to a named pipe as a client.
    #[cfg(unix)]
    pub async fn connect(name: &str) -> io::Result<Self> {
        tokio::net::UnixStream::connect(pipe_path(name))
            .await
            .map(IpcStream)
    }

    #[cfg(windows)]
    pub async fn connect(name: &str) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ClientOptions;
        ClientOptions::new()
            .open(pipe_path(name))
            .map(IpcStream::Client)
    }
}

#[cfg(unix)]
impl AsyncRead for IpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

#[cfg(unix)]
impl AsyncWrite for IpcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

#[cfg(windows)]
impl AsyncRead for IpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            IpcStream::Client(c) => Pin::new(c).poll_read(cx, buf),
            IpcStream::Server(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

#[cfg(windows)]
impl AsyncWrite for IpcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            IpcStream::Client(c) => Pin::new(c).poll_write(cx, buf),
            IpcStream::Server(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            IpcStream::Client(c) => Pin::new(c).poll_flush(cx),
            IpcStream::Server(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            IpcStream::Client(c) => Pin::new(c).poll_shutdown(cx),
            IpcStream::Server(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Server side of a named pipe; the capture session owns two of these.
#[cfg(unix)]
pub struct IpcListener {
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl IpcListener {
    pub fn bind(name: &str) -> io::Result<Self> {
        let path = pipe_path(name);
        // A stale socket from a crashed run blocks the bind
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub async fn accept(&mut self) -> io::Result<IpcStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcStream(stream))
    }
}

#[cfg(unix)]
impl Drop for IpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(windows)]
pub struct IpcListener {
    name: String,
    pending: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

#[cfg(windows)]
impl IpcListener {
    pub fn bind(name: &str) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let pending = ServerOptions::new()
            .first_pipe_instance(true)
            .create(pipe_path(name))?;
        Ok(Self {
            name: name.to_string(),
            pending: Some(pending),
        })
    }

    pub async fn accept(&mut self) -> io::Result<IpcStream> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let server = match self.pending.take() {
            Some(s) => s,
            None => ServerOptions::new().create(pipe_path(&self.name))?,
        };
        server.connect().await?;
        Ok(IpcStream::Server(server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_is_length_type_payload() {
        let buf = FrameCodec::encode(3, b"hello");
        assert_eq!(&buf[..4], &5u32.to_le_bytes());
        assert_eq!(buf[4], 3);
        assert_eq!(&buf[5..], b"hello");
    }

    #[test]
    fn decode_round_trip_and_partial() {
        let buf = FrameCodec::encode(7, b"payload");
        let (frame, used) = FrameCodec::decode(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(frame.kind, 7);
        assert_eq!(&frame.payload[..], b"payload");

        // Incomplete buffers decode to None, not an error
        assert!(FrameCodec::decode(&buf[..3]).unwrap().is_none());
        assert!(FrameCodec::decode(&buf[..buf.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_oversized_frames() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.push(0);
        assert!(FrameCodec::decode(&buf).is_err());
    }

    #[test]
    fn empty_payload_frame() {
        let buf = FrameCodec::encode(2, b"");
        let (frame, used) = FrameCodec::decode(&buf).unwrap().unwrap();
        assert_eq!(used, 5);
        assert_eq!(frame.kind, 2);
        assert!(frame.payload.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_round_trip() {
        let name = format!("vibeshine-test-{}", std::process::id());
        let mut listener = IpcListener::bind(&name).unwrap();

        let client = tokio::spawn({
            let name = name.clone();
            async move {
                let mut stream = IpcStream::connect(&name).await.unwrap();
                write_frame(&mut stream, 9, b"ping").await.unwrap();
                read_frame(&mut stream).await.unwrap()
            }
        });

        let mut server = listener.accept().await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame.kind, 9);
        write_frame(&mut server, 10, &frame.payload).await.unwrap();

        let reply = client.await.unwrap();
        assert_eq!(reply.kind, 10);
        assert_eq!(&reply.payload[..], b"ping");
    }
}
