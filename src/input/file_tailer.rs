use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader as AsyncBufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use super::InputError;
use crate::models::RawLine;

/// Tails a log file, delivering each new line as a [`RawLine`]
pub struct FileTailer {
    file_path: PathBuf,
    source: String,
    from_start: bool,
    poll_interval: Duration,
}

impl FileTailer {
    /// Create a tailer that starts at the current end of the file
    pub fn new(file_path: PathBuf) -> Self {
        let source = file_path.display().to_string();
        FileTailer {
            file_path,
            source,
            from_start: false,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Read existing content before following new lines
    pub fn from_start(mut self) -> Self {
        self.from_start = true;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn open(&self, at_end: bool) -> Result<(AsyncBufReader<AsyncFile>, u64), InputError> {
        let file = AsyncFile::open(&self.file_path).await?;
        let mut reader = AsyncBufReader::new(file);
        let position = if at_end {
            reader.seek(std::io::SeekFrom::End(0)).await?
        } else {
            0
        };
        Ok((reader, position))
    }

    /// Run until the channel closes or `shutdown` flips to true.
    ///
    /// A file that shrinks (truncated or rotated in place) is re-read from the start.
    pub async fn run(
        &self,
        tx: mpsc::Sender<RawLine>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), InputError> {
        let (mut reader, mut position) = self.open(!self.from_start).await?;
        let mut pending: Vec<u8> = Vec::new();

        log::info!("File tailer started for {:?}", self.file_path);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match reader.read_until(b'\n', &mut pending).await {
                Ok(0) => {
                    if let Ok(metadata) = tokio::fs::metadata(&self.file_path).await {
                        if metadata.len() < position {
                            log::warn!("{:?} was truncated, reading from the start", self.file_path);
                            let (new_reader, new_position) = self.open(false).await?;
                            reader = new_reader;
                            position = new_position;
                            pending.clear();
                            continue;
                        }
                    }

                    tokio::select! {
                        _ = sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(n) => {
                    position += n as u64;
                    // A line without its newline is still being written
                    if pending.last() != Some(&b'\n') {
                        continue;
                    }

                    // Invalid UTF-8 is kept lossily; the normalizer degrades it
                    let line = String::from_utf8_lossy(&pending)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    pending.clear();
                    if line.trim().is_empty() {
                        continue;
                    }
                    if tx.send(RawLine::now(line, self.source.clone())).await.is_err() {
                        log::info!("Channel closed, stopping file tailer");
                        return Err(InputError::ChannelClosed);
                    }
                }
                Err(e) => {
                    log::error!("Error reading file: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        log::info!("File tailer stopped for {:?}", self.file_path);
        Ok(())
    }
}
