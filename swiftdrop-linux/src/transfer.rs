//! File transfer over a formed group. The group owner listens; a client dials it.
//!
//! One file per TCP connection. The sender writes a `TransferHeader` frame, the receiver
//! answers `Accepted` or `Rejected`, the sender streams exactly `size` bytes, and the
//! receiver confirms with `Received`. Control frames use the core's length-prefixed framing.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use swiftdrop_core::{body_len, decode_frame, encode_frame, HEADER_LEN};
use sysinfo::Disks;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;

pub const TRANSFER_VERSION: u8 = 1;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CHUNK_LEN: usize = 64 * 1024;
/// Control frames are tiny; anything bigger is not a SwiftDrop peer.
const CONTROL_FRAME_LIMIT: usize = 64 * 1024;
/// Progress is published in steps of this many percent.
const PROGRESS_STEP: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub version: u8,
    pub file_name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferReply {
    Accepted,
    Rejected { reason: String },
    Received { bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress {
        direction: Direction,
        file_name: String,
        percent: u8,
    },
    Complete {
        direction: Direction,
        file_name: String,
        /// Source file when sending, saved file when receiving.
        path: PathBuf,
        bytes: u64,
    },
    Failed {
        direction: Direction,
        file_name: Option<String>,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file does not exist: {}", .0.display())]
    NotFound(PathBuf),
    #[error("not a regular file: {}", .0.display())]
    NotAFile(PathBuf),
    #[error("cannot read file {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("file is empty: {}", .0.display())]
    Empty(PathBuf),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("invalid file size received")]
    InvalidSize,
    #[error("not enough storage space: need {needed} bytes, {available} available")]
    InsufficientStorage { needed: u64, available: u64 },
    #[error("unsupported transfer version {0}")]
    Version(u8),
    #[error("peer rejected transfer: {0}")]
    Rejected(String),
    #[error("connection timeout to {0}")]
    ConnectTimeout(SocketAddr),
    #[error("transfer interrupted after {received} of {expected} bytes")]
    Interrupted { received: u64, expected: u64 },
    #[error("file size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Percent tracker that only reports every `PROGRESS_STEP` percent, and always reports 100.
struct Progress {
    total: u64,
    done: u64,
    last: u8,
}

impl Progress {
    fn new(total: u64) -> Self {
        Self {
            total,
            done: 0,
            last: 0,
        }
    }

    fn advance(&mut self, n: u64) -> Option<u8> {
        self.done += n;
        let percent = (u128::from(self.done) * 100 / u128::from(self.total.max(1))).min(100) as u8;
        if percent >= self.last.saturating_add(PROGRESS_STEP) || (percent == 100 && self.last < 100) {
            self.last = percent;
            Some(percent)
        } else {
            None
        }
    }
}

/// Check a file before offering it: exists, regular, readable, non-empty.
pub async fn validate_file(path: &Path) -> Result<(File, u64), TransferError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(TransferError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if !meta.is_file() {
        return Err(TransferError::NotAFile(path.to_path_buf()));
    }
    if meta.len() == 0 {
        return Err(TransferError::Empty(path.to_path_buf()));
    }
    let file = File::open(path)
        .await
        .map_err(|source| TransferError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
    Ok((file, meta.len()))
}

/// Accept only a bare file name; anything that could escape the download directory is refused.
pub fn sanitize_name(name: &str) -> Result<String, TransferError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.starts_with(".swiftdrop-");
    if bad {
        return Err(TransferError::InvalidName(name.to_string()));
    }
    Ok(name.to_string())
}

/// `available` is None when free space cannot be determined; the transfer then proceeds.
pub fn check_storage(needed: u64, available: Option<u64>) -> Result<(), TransferError> {
    match available {
        Some(available) if available < needed => {
            Err(TransferError::InsufficientStorage { needed, available })
        }
        _ => Ok(()),
    }
}

/// Free bytes on the filesystem holding `dir` (longest matching mount point).
pub fn available_space(dir: &Path) -> Option<u64> {
    let dir = std::fs::canonicalize(dir).ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Human-readable size for logs, e.g. `1.50MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

async fn write_control<W, T>(w: &mut W, value: &T) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value).map_err(|e| TransferError::Protocol(e.to_string()))?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

async fn read_control<R, T>(r: &mut R) -> Result<T, TransferError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut frame = vec![0u8; HEADER_LEN];
    r.read_exact(&mut frame).await?;
    let len = body_len(&frame).map_err(|e| TransferError::Protocol(e.to_string()))?;
    if len > CONTROL_FRAME_LIMIT {
        return Err(TransferError::Protocol(format!("control frame of {len} bytes")));
    }
    frame.resize(HEADER_LEN + len, 0);
    r.read_exact(&mut frame[HEADER_LEN..]).await?;
    let (value, _) = decode_frame(&frame).map_err(|e| TransferError::Protocol(e.to_string()))?;
    Ok(value)
}

/// Sends and receives files; progress and outcomes are published on `subscribe()`.
pub struct FileTransfer {
    port: u16,
    download_dir: PathBuf,
    events: broadcast::Sender<TransferEvent>,
}

impl FileTransfer {
    pub fn new(port: u16, download_dir: impl Into<PathBuf>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            port,
            download_dir: download_dir.into(),
            events,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.transfer_port, cfg.download_dir(), cfg.event_capacity)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn publish(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    /// Send `path` to the group owner at `host` on the configured port.
    pub async fn send_to_host(&self, host: IpAddr, path: &Path) -> Result<u64, TransferError> {
        self.send_file(SocketAddr::new(host, self.port), path).await
    }

    /// Send one file. Returns the byte count the receiver confirmed.
    pub async fn send_file(&self, addr: SocketAddr, path: &Path) -> Result<u64, TransferError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let result = self.send_inner(addr, path, &file_name).await;
        match &result {
            Ok(bytes) => {
                info!(peer = %addr, file = %file_name, size = %format_size(*bytes), "file sent");
                self.publish(TransferEvent::Complete {
                    direction: Direction::Send,
                    file_name,
                    path: path.to_path_buf(),
                    bytes: *bytes,
                });
            }
            Err(e) => {
                warn!(peer = %addr, file = %file_name, error = %e, "send failed");
                self.publish(TransferEvent::Failed {
                    direction: Direction::Send,
                    file_name: Some(file_name),
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn send_inner(
        &self,
        addr: SocketAddr,
        path: &Path,
        file_name: &str,
    ) -> Result<u64, TransferError> {
        let (mut file, size) = validate_file(path).await?;
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransferError::ConnectTimeout(addr))??;
        debug!(peer = %addr, file = file_name, size, "offering file");
        write_control(
            &mut stream,
            &TransferHeader {
                version: TRANSFER_VERSION,
                file_name: file_name.to_string(),
                size,
            },
        )
        .await?;
        match read_control(&mut stream).await? {
            TransferReply::Accepted => {}
            TransferReply::Rejected { reason } => return Err(TransferError::Rejected(reason)),
            other => return Err(TransferError::Protocol(format!("unexpected {other:?}"))),
        }

        let mut progress = Progress::new(size);
        let mut buf = vec![0u8; CHUNK_LEN];
        let mut sent = 0u64;
        while sent < size {
            let want = (size - sent).min(CHUNK_LEN as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                // File shrank after validation.
                return Err(TransferError::Interrupted {
                    received: sent,
                    expected: size,
                });
            }
            stream.write_all(&buf[..n]).await?;
            sent += n as u64;
            if let Some(percent) = progress.advance(n as u64) {
                self.publish(TransferEvent::Progress {
                    direction: Direction::Send,
                    file_name: file_name.to_string(),
                    percent,
                });
            }
        }
        stream.flush().await?;

        match read_control(&mut stream).await? {
            TransferReply::Received { bytes } if bytes == size => Ok(bytes),
            TransferReply::Received { bytes } => Err(TransferError::SizeMismatch {
                expected: size,
                actual: bytes,
            }),
            TransferReply::Rejected { reason } => Err(TransferError::Rejected(reason)),
            TransferReply::Accepted => Err(TransferError::Protocol("unexpected Accepted".into())),
        }
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind((IpAddr::from([0u8, 0, 0, 0]), self.port)).await
    }

    /// Accept transfers until the listener fails. Each connection runs on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, from) = listener.accept().await?;
            debug!(peer = %from, "incoming transfer");
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.receive(stream).await;
            });
        }
    }

    /// Receive one file from an accepted connection into the download directory.
    pub async fn receive(&self, mut stream: TcpStream) -> Result<PathBuf, TransferError> {
        let header: TransferHeader = match read_control(&mut stream).await {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "bad transfer header");
                self.publish(TransferEvent::Failed {
                    direction: Direction::Receive,
                    file_name: None,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        let result = self.receive_inner(&mut stream, &header).await;
        match &result {
            Ok(path) => {
                info!(file = %path.display(), size = %format_size(header.size), "file received");
                self.publish(TransferEvent::Complete {
                    direction: Direction::Receive,
                    file_name: header.file_name.clone(),
                    path: path.clone(),
                    bytes: header.size,
                });
            }
            Err(e) => {
                warn!(file = %header.file_name, error = %e, "receive failed");
                // The sender may already be gone.
                let _ = write_control(
                    &mut stream,
                    &TransferReply::Rejected {
                        reason: e.to_string(),
                    },
                )
                .await;
                self.publish(TransferEvent::Failed {
                    direction: Direction::Receive,
                    file_name: Some(header.file_name.clone()),
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn receive_inner(
        &self,
        stream: &mut TcpStream,
        header: &TransferHeader,
    ) -> Result<PathBuf, TransferError> {
        if header.version != TRANSFER_VERSION {
            return Err(TransferError::Version(header.version));
        }
        let name = sanitize_name(&header.file_name)?;
        if header.size == 0 {
            return Err(TransferError::InvalidSize);
        }
        tokio::fs::create_dir_all(&self.download_dir).await?;
        check_storage(header.size, available_space(&self.download_dir))?;
        write_control(stream, &TransferReply::Accepted).await?;

        let partial = self.download_dir.join(format!(".swiftdrop-{name}.part"));
        let mut file = File::create(&partial).await?;
        let mut progress = Progress::new(header.size);
        let mut buf = vec![0u8; CHUNK_LEN];
        let mut received = 0u64;
        let copied: Result<(), TransferError> = async {
            while received < header.size {
                let want = (header.size - received).min(CHUNK_LEN as u64) as usize;
                let n = stream.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(TransferError::Interrupted {
                        received,
                        expected: header.size,
                    });
                }
                file.write_all(&buf[..n]).await?;
                received += n as u64;
                if let Some(percent) = progress.advance(n as u64) {
                    self.publish(TransferEvent::Progress {
                        direction: Direction::Receive,
                        file_name: name.clone(),
                        percent,
                    });
                }
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);
        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        let actual = tokio::fs::metadata(&partial).await?.len();
        if actual != header.size {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(TransferError::SizeMismatch {
                expected: header.size,
                actual,
            });
        }
        let target = self.download_dir.join(&name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            warn!(file = %target.display(), "overwriting existing file");
        }
        tokio::fs::rename(&partial, &target).await?;
        write_control(stream, &TransferReply::Received { bytes: actual }).await?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn progress_reports_in_steps_and_always_finishes() {
        let mut p = Progress::new(100);
        let reported: Vec<u8> = (0..100).filter_map(|_| p.advance(1)).collect();
        assert_eq!(reported.len(), 20);
        assert_eq!(reported.first(), Some(&5));
        assert_eq!(reported.last(), Some(&100));

        let mut p = Progress::new(3);
        assert_eq!(p.advance(1), Some(33));
        assert_eq!(p.advance(1), Some(66));
        assert_eq!(p.advance(1), Some(100));
        assert_eq!(p.advance(0), None);
    }

    #[test]
    fn names_that_escape_are_refused() {
        for bad in ["", ".", "..", "../etc/passwd", "a/b", "a\\b", "nul\0", ".swiftdrop-x.part"] {
            assert!(sanitize_name(bad).is_err(), "{bad:?} accepted");
        }
        assert_eq!(sanitize_name("holiday.jpg").unwrap(), "holiday.jpg");
        assert_eq!(sanitize_name(".bashrc").unwrap(), ".bashrc");
    }

    #[test]
    fn storage_check() {
        assert!(check_storage(10, Some(10)).is_ok());
        assert!(check_storage(10, None).is_ok());
        assert!(matches!(
            check_storage(11, Some(10)),
            Err(TransferError::InsufficientStorage {
                needed: 11,
                available: 10
            })
        ));
    }

    #[test]
    fn sizes_for_logs() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1536), "1.50KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00MB");
    }

    #[tokio::test]
    async fn validation_rejects_missing_empty_and_directories() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(validate_file(&missing).await, Err(TransferError::NotFound(_))));
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(validate_file(&empty).await, Err(TransferError::Empty(_))));
        assert!(matches!(validate_file(dir.path()).await, Err(TransferError::NotAFile(_))));
    }

    async fn receiver(dir: &TempDir) -> (Arc<FileTransfer>, SocketAddr) {
        let transfer = Arc::new(FileTransfer::new(0, dir.path().join("inbox"), 256));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(transfer.clone().serve(listener));
        (transfer, addr)
    }

    #[tokio::test]
    async fn file_arrives_intact_with_events_on_both_sides() {
        let dir = TempDir::new().unwrap();
        let (rx_side, addr) = receiver(&dir).await;
        let mut rx_events = rx_side.subscribe();

        let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let src = dir.path().join("photo.bin");
        std::fs::write(&src, &content).unwrap();

        let sender = FileTransfer::new(0, dir.path().join("unused"), 256);
        let mut tx_events = sender.subscribe();
        let bytes = sender.send_file(addr, &src).await.unwrap();
        assert_eq!(bytes, content.len() as u64);

        let saved = dir.path().join("inbox").join("photo.bin");
        let complete = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let TransferEvent::Complete { path, .. } = rx_events.recv().await.unwrap() {
                    return path;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(complete, saved);
        assert_eq!(std::fs::read(&saved).unwrap(), content);

        let mut percents = Vec::new();
        while let Ok(e) = tx_events.try_recv() {
            if let TransferEvent::Progress { percent, .. } = e {
                percents.push(percent);
            }
        }
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn receiver_refuses_path_escape() {
        let dir = TempDir::new().unwrap();
        let (_rx_side, addr) = receiver(&dir).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_control(
            &mut stream,
            &TransferHeader {
                version: TRANSFER_VERSION,
                file_name: "../evil".into(),
                size: 4,
            },
        )
        .await
        .unwrap();
        let reply: TransferReply = read_control(&mut stream).await.unwrap();
        assert!(matches!(reply, TransferReply::Rejected { reason } if reason.contains("invalid file name")));
        assert!(!dir.path().join("evil").exists());
    }

    #[tokio::test]
    async fn truncated_upload_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let transfer = FileTransfer::new(0, dir.path().join("inbox"), 16);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_control(
                &mut stream,
                &TransferHeader {
                    version: TRANSFER_VERSION,
                    file_name: "big.iso".into(),
                    size: 1_000,
                },
            )
            .await
            .unwrap();
            let reply: TransferReply = read_control(&mut stream).await.unwrap();
            assert_eq!(reply, TransferReply::Accepted);
            stream.write_all(&[7u8; 10]).await.unwrap();
            // Dropping the stream closes it mid-file.
        });

        let (stream, _) = listener.accept().await.unwrap();
        let result = transfer.receive(stream).await;
        client.await.unwrap();
        assert!(matches!(
            result,
            Err(TransferError::Interrupted {
                received: 10,
                expected: 1_000
            })
        ));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("inbox")).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
