//! Pulling side of a transfer: writes files into the download directory.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::{
    configure_tcp_keepalive, linger_after_error, send_error, FileTransferObserver,
    FileTransferState, TransferCore, TransferOptions, CANCELED_MESSAGE,
};
use crate::error::{Error, Result};
use crate::file::{unique_path, FileWriter};
use crate::observer::lock;
use crate::protocol::messages::{DownloadReq, ErrorReq, FileExploreFile, TransferMessage};
use crate::protocol::{decode_body, read_frame, write_frame, Frame};

/// Delay between connection attempts while the sender is not listening yet.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

struct DownloadShared {
    core: Arc<TransferCore>,
    remote: SocketAddr,
    download_dir: PathBuf,
    connect_timeout: Duration,
    queue: Mutex<VecDeque<FileExploreFile>>,
    remaining: AtomicUsize,
    /// Held while choosing a name and creating the file, so two
    /// connections never pick the same path.
    naming: tokio::sync::Mutex<()>,
    completed: Mutex<Vec<PathBuf>>,
}

impl DownloadShared {
    fn next_file(&self) -> Option<FileExploreFile> {
        lock(&self.queue).pop_front()
    }

    fn mark_done(&self, path: PathBuf) {
        lock(&self.completed).push(path);
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.core.transition(FileTransferState::Finished);
        }
    }
}

/// Downloads files from a [`super::FileSender`] over parallel connections.
pub struct FileDownloader {
    core: Arc<TransferCore>,
    files: Vec<FileExploreFile>,
    remote: SocketAddr,
    options: TransferOptions,
    shared: Mutex<Option<Arc<DownloadShared>>>,
}

impl FileDownloader {
    /// Prepare to download `files` from the sender at `remote`.
    ///
    /// `options.buffer_size` and `options.max_connection` should hold the
    /// values negotiated over FileExplore.
    #[must_use]
    pub fn new(files: Vec<FileExploreFile>, remote: SocketAddr, options: TransferOptions) -> Self {
        Self {
            core: TransferCore::new("Downloader"),
            files,
            remote,
            options,
            shared: Mutex::new(None),
        }
    }

    /// Validate the file list and start the download workers.
    ///
    /// # Errors
    ///
    /// Fails, leaving the transfer in `Error`, if the list is empty, a file
    /// has size 0, or the download directory cannot be created.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.prepare().await {
            self.core.fail(&e);
            return Err(e);
        }
        if !self.core.transition(FileTransferState::Started) {
            return Err(Error::State(format!(
                "downloader cannot start from {}",
                self.core.state()
            )));
        }

        let mut queue: Vec<FileExploreFile> = self.files.clone();
        queue.sort_by(|a, b| b.size.cmp(&a.size));

        let shared = Arc::new(DownloadShared {
            core: Arc::clone(&self.core),
            remote: self.remote,
            download_dir: self.options.download_dir.clone(),
            connect_timeout: self.options.accept_timeout,
            queue: Mutex::new(queue.into()),
            remaining: AtomicUsize::new(self.files.len()),
            naming: tokio::sync::Mutex::new(()),
            completed: Mutex::new(Vec::new()),
        });
        *lock(&self.shared) = Some(Arc::clone(&shared));

        let workers = self.options.max_connection.clamp(1, self.files.len());
        tracing::info!(
            "Downloading {} file(s) from {} over {} connection(s)",
            self.files.len(),
            self.remote,
            workers
        );
        for _ in 0..workers {
            tokio::spawn(run_worker(Arc::clone(&shared), self.options.buffer_size));
        }
        Ok(())
    }

    async fn prepare(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(Error::InvalidFile("no files to download".to_string()));
        }
        if let Some(empty) = self.files.iter().find(|f| f.size == 0) {
            return Err(Error::InvalidFile(format!("{} has size 0", empty.name)));
        }
        tokio::fs::create_dir_all(&self.options.download_dir)
            .await
            .map_err(|e| {
                Error::Io(format!(
                    "cannot create {}: {e}",
                    self.options.download_dir.display()
                ))
            })
    }

    /// Paths of the files written so far.
    pub fn downloaded_files(&self) -> Vec<PathBuf> {
        lock(&self.shared)
            .as_ref()
            .map(|shared| lock(&shared.completed).clone())
            .unwrap_or_default()
    }

    /// Current state.
    pub fn state(&self) -> FileTransferState {
        self.core.state()
    }

    /// Cancel a running download. The sender receives `ErrorReq("Canceled")`
    /// and partially written files are removed.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Register an observer. It immediately receives the current state.
    pub fn add_observer(&self, observer: Arc<dyn FileTransferObserver>) {
        self.core.add_observer(observer);
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, observer: &Arc<dyn FileTransferObserver>) {
        self.core.remove_observer(observer);
    }

    /// Resolve once the transfer reaches a terminal state.
    pub async fn wait_terminal(&self) -> FileTransferState {
        self.core.wait_terminal().await
    }
}

async fn connect_with_retry(shared: &DownloadShared) -> Result<TcpStream> {
    let halt = shared.core.halt_token();
    let deadline = Instant::now() + shared.connect_timeout;
    loop {
        match TcpStream::connect(shared.remote).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                tracing::debug!("Connect to {} failed, retrying: {}", shared.remote, e);
                tokio::select! {
                    () = halt.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
                }
            }
            Err(e) => {
                return Err(Error::Transport(format!(
                    "cannot connect to sender {}: {e}",
                    shared.remote
                )))
            }
        }
    }
}

async fn run_worker(shared: Arc<DownloadShared>, buffer_size: usize) {
    let core = &shared.core;
    let stream = match connect_with_retry(&shared).await {
        Ok(stream) => stream,
        Err(e) => {
            core.fail(&e);
            return;
        }
    };
    configure_tcp_keepalive(&stream);
    let (mut reader, mut writer) = stream.into_split();
    let mut next_id = 0i64;

    tracing::debug!(
        "Data connection to {} open (chunks up to {} bytes)",
        shared.remote,
        buffer_size
    );
    loop {
        if core.halt_token().is_cancelled() {
            break;
        }
        let Some(file) = shared.next_file() else {
            let finished = Frame::new(TransferMessage::FinishedReq.code(), next_id, Vec::new());
            if let Err(e) = write_frame(&mut writer, &finished).await {
                tracing::debug!("Failed to send FinishedReq: {}", e);
            }
            break;
        };

        match download_file(&shared, &mut reader, &mut writer, &file, &mut next_id).await {
            Ok(Some(path)) => shared.mark_done(path),
            Ok(None) => break,
            Err(e) => {
                let reported = !matches!(e, Error::RemoteApplication(_));
                if reported {
                    send_error(&mut writer, next_id, &e.to_string()).await;
                }
                core.fail(&e);
                if reported {
                    linger_after_error(&mut reader, &mut writer).await;
                }
                return;
            }
        }
    }

    if core.state() == FileTransferState::Canceled {
        send_error(&mut writer, next_id, CANCELED_MESSAGE).await;
        linger_after_error(&mut reader, &mut writer).await;
    }
}

/// Request one file and write it to disk. Returns `None` if the transfer
/// halted midway; the partial file is removed.
async fn download_file(
    shared: &DownloadShared,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    file: &FileExploreFile,
    next_id: &mut i64,
) -> Result<Option<PathBuf>> {
    let request = DownloadReq {
        file: file.clone(),
        start: 0,
        end: file.size,
    };
    write_frame(
        writer,
        &Frame::json(TransferMessage::DownloadReq.code(), *next_id, &request)?,
    )
    .await?;
    *next_id += 1;

    let mut output = {
        let _naming = shared.naming.lock().await;
        FileWriter::create(unique_path(&shared.download_dir, &file.name), file.size).await?
    };
    tracing::debug!("Receiving {} into {}", file.name, output.output_path.display());
    shared.core.start_file(file);

    match receive_chunks(shared, reader, &mut output, file).await {
        Ok(true) => {
            let path = output.finish().await?;
            shared.core.end_file(file);
            Ok(Some(path))
        }
        Ok(false) => {
            output.discard().await;
            Ok(None)
        }
        Err(e) => {
            output.discard().await;
            Err(e)
        }
    }
}

async fn receive_chunks(
    shared: &DownloadShared,
    reader: &mut OwnedReadHalf,
    output: &mut FileWriter,
    file: &FileExploreFile,
) -> Result<bool> {
    let halt = shared.core.halt_token();
    while !output.is_complete() {
        let frame = tokio::select! {
            () = halt.cancelled() => return Ok(false),
            frame = read_frame(reader) => frame?,
        };
        match TransferMessage::from_code(frame.message_type) {
            Some(TransferMessage::SendData) => {
                output.write_chunk(&frame.body).await?;
                shared.core.progress(file, output.bytes_written);
            }
            Some(TransferMessage::ErrorReq) => {
                let msg = decode_body::<ErrorReq>(&frame.body)
                    .map_or_else(|e| e.to_string(), |r| r.error_msg);
                return Err(Error::RemoteApplication(msg));
            }
            _ => {
                tracing::debug!(
                    "Ignoring message type {} while receiving {}",
                    frame.message_type,
                    file.name
                );
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{Ipv4Addr, SocketAddrV4};

    use tempfile::TempDir;

    use crate::transfer::{FileSender, SenderFile};

    fn options(dir: &TempDir, max_connection: usize, buffer_size: usize) -> TransferOptions {
        TransferOptions {
            port: 0,
            max_connection,
            buffer_size,
            download_dir: dir.path().join("downloads"),
            accept_timeout: Duration::from_secs(5),
        }
    }

    fn localhost() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    #[tokio::test]
    async fn test_rejects_empty_file() {
        let dir = TempDir::new().unwrap();
        let file = FileExploreFile {
            name: "empty".to_string(),
            path: "/empty".to_string(),
            size: 0,
            last_modify: 0,
        };
        let downloader = FileDownloader::new(vec![file], localhost(), options(&dir, 1, 16));
        assert!(downloader.start().await.is_err());
        assert!(matches!(downloader.state(), FileTransferState::Error(_)));
    }

    #[tokio::test]
    async fn test_parallel_download_and_name_collision() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("other")).unwrap();
        let first: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let second: Vec<u8> = (0..3_000u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(source.join("same.bin"), &first).unwrap();
        std::fs::write(source.join("other").join("same.bin"), &second).unwrap();

        let files = vec![
            SenderFile::from_path(source.join("same.bin")).unwrap(),
            SenderFile::from_path(source.join("other").join("same.bin")).unwrap(),
        ];
        let explore_files: Vec<_> = files.iter().map(|f| f.explore_file.clone()).collect();

        let opts = options(&dir, 2, 1024);
        let sender = FileSender::with_bind_addr(files, localhost(), &opts);
        sender.start().await.unwrap();
        let addr = sender.local_addr().unwrap();

        let downloader = FileDownloader::new(explore_files, addr, opts.clone());
        downloader.start().await.unwrap();

        assert_eq!(downloader.wait_terminal().await, FileTransferState::Finished);
        assert_eq!(sender.wait_terminal().await, FileTransferState::Finished);

        let mut written: Vec<Vec<u8>> = downloader
            .downloaded_files()
            .iter()
            .map(|p| std::fs::read(p).unwrap())
            .collect();
        written.sort_by_key(Vec::len);
        assert_eq!(written, vec![second, first]);

        let downloads = opts.download_dir;
        assert!(downloads.join("same.bin").exists());
        assert!(downloads.join("same(1).bin").exists());
    }

    #[tokio::test]
    async fn test_sender_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.bin");
        std::fs::write(&path, b"soon gone").unwrap();
        let file = SenderFile::from_path(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let sender = FileSender::with_bind_addr(vec![file], localhost(), &options(&dir, 1, 16));
        assert!(sender.start().await.is_err());
        assert!(matches!(sender.state(), FileTransferState::Error(_)));
    }
}
