//! Output capture for running workers
//!
//! Each worker gets a bounded in-memory ring of [`LogEntry`] values and a
//! best-effort daily log file under `<install_path>/<logs dir>/`. Stream
//! readers run as their own tasks, so a slow disk or a chatty server never
//! stalls the supervisor or other workers.

use crate::best_effort;
use crate::config::LogConfig;
use crate::error::{HearthError, Result};
use crate::events::{EventBus, WorkerEvent};
use crate::worker::Worker;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

/// Origin of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Written by the supervisor itself (commands sent, exits observed)
    System,
}

impl LogStream {
    fn label(self) -> &'static str {
        match self {
            LogStream::Stdout => "STDOUT",
            LogStream::Stderr => "STDERR",
            LogStream::System => "SYSTEM",
        }
    }
}

/// One captured line; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Per-worker sequence number
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

impl LogEntry {
    /// On-disk form: `[timestamp] [STREAM] message`
    pub fn to_line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.stream.label(),
            self.message
        )
    }
}

/// A daily log file on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFileInfo {
    pub name: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// FIFO ring of the most recent entries
#[derive(Debug)]
struct LogBuffer {
    next_id: u64,
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            next_id: 1,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, stream: LogStream, message: String) -> LogEntry {
        let entry = LogEntry {
            id: self.next_id,
            timestamp: Utc::now(),
            stream,
            message,
        };
        self.next_id = self.next_id.saturating_add(1);
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        entry
    }

    fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let start = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(start).cloned().collect()
    }
}

/// Appends entries to `<dir>/<YYYY-MM-DD>.log`, rolling over at midnight UTC
#[derive(Debug)]
struct DailyLogWriter {
    dir: PathBuf,
    current: Option<(NaiveDate, tokio::fs::File)>,
}

impl DailyLogWriter {
    fn new(dir: PathBuf) -> Self {
        Self { dir, current: None }
    }

    async fn append(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let date = entry.timestamp.date_naive();
        let stale = !matches!(&self.current, Some((open, _)) if *open == date);
        if stale {
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.dir.join(format!("{}.log", date.format("%Y-%m-%d")));
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            self.current = Some((date, file));
        }

        if let Some((_, file)) = self.current.as_mut() {
            let mut line = entry.to_line();
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()).await {
                // Reopen on the next append.
                self.current = None;
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Buffer plus disk sink for one worker
#[derive(Debug)]
struct WorkerLog {
    buffer: Mutex<LogBuffer>,
    writer: Mutex<DailyLogWriter>,
}

impl WorkerLog {
    async fn record(
        &self,
        worker_id: &str,
        events: &EventBus,
        stream: LogStream,
        message: String,
    ) -> LogEntry {
        let entry = self.buffer.lock().await.push(stream, message);
        best_effort::soft(
            worker_id,
            "append daily log",
            self.writer.lock().await.append(&entry).await,
        );
        events.publish(WorkerEvent::Log {
            worker_id: worker_id.to_string(),
            entry: entry.clone(),
        });
        entry
    }
}

/// Per-worker output capture
pub struct OutputCapture {
    logs: RwLock<HashMap<String, Arc<WorkerLog>>>,
    config: LogConfig,
    events: EventBus,
}

impl OutputCapture {
    /// Create a capture publishing `Log` events on `events`
    pub fn new(config: LogConfig, events: EventBus) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            config,
            events,
        }
    }

    /// Directory holding a worker's daily log files
    pub fn log_dir(&self, install_path: &Path) -> PathBuf {
        install_path.join(&self.config.directory)
    }

    async fn worker_log(&self, worker: &Worker) -> Arc<WorkerLog> {
        if let Some(log) = self.logs.read().await.get(&worker.id) {
            return log.clone();
        }
        let mut logs = self.logs.write().await;
        logs.entry(worker.id.clone())
            .or_insert_with(|| {
                Arc::new(WorkerLog {
                    buffer: Mutex::new(LogBuffer::new(self.config.buffer_capacity)),
                    writer: Mutex::new(DailyLogWriter::new(self.log_dir(&worker.install_path))),
                })
            })
            .clone()
    }

    /// Begin consuming a process's output and error streams.
    ///
    /// Every captured entry is also forwarded on the returned channel so the
    /// caller can parse telemetry from it. The channel closes once both
    /// streams reach EOF.
    pub async fn attach<O, E>(
        &self,
        worker: &Worker,
        stdout: Option<O>,
        stderr: Option<E>,
    ) -> (mpsc::UnboundedReceiver<LogEntry>, Vec<JoinHandle<()>>)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(2);
        if let Some(out) = stdout {
            tasks.push(self.attach_stream(worker, LogStream::Stdout, out, tx.clone()).await);
        }
        if let Some(err) = stderr {
            tasks.push(self.attach_stream(worker, LogStream::Stderr, err, tx.clone()).await);
        }
        (rx, tasks)
    }

    /// Consume one stream line by line on its own task
    pub async fn attach_stream<R>(
        &self,
        worker: &Worker,
        stream: LogStream,
        reader: R,
        tx: mpsc::UnboundedSender<LogEntry>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let log = self.worker_log(worker).await;
        let events = self.events.clone();
        let worker_id = worker.id.clone();
        let max_line = self.config.max_line_bytes.max(1) as u64;

        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::with_capacity(256);
            loop {
                buf.clear();
                // An overlong line arrives as several entries of at most `max_line` bytes.
                match (&mut reader).take(max_line).read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf);
                        let line = text.trim_end_matches(['\r', '\n']);
                        if line.trim().is_empty() {
                            continue;
                        }
                        let entry = log.record(&worker_id, &events, stream, line.to_string()).await;
                        // Receiver gone just means nobody parses telemetry.
                        let _ = tx.send(entry);
                    }
                    Err(e) => {
                        best_effort::soft::<(), _>(&worker_id, "read process output", Err(e));
                        break;
                    }
                }
            }
            debug!(worker_id = %worker_id, ?stream, "Output stream closed");
        })
    }

    /// Append a supervisor-authored entry
    pub async fn record(&self, worker: &Worker, stream: LogStream, message: impl Into<String>) -> LogEntry {
        let log = self.worker_log(worker).await;
        log.record(&worker.id, &self.events, stream, message.into()).await
    }

    /// The most recent `limit` entries from memory, oldest first
    pub async fn recent(&self, worker_id: &str, limit: usize) -> Vec<LogEntry> {
        let log = self.logs.read().await.get(worker_id).cloned();
        match log {
            Some(log) => log.buffer.lock().await.recent(limit),
            None => Vec::new(),
        }
    }

    /// Empty the in-memory buffer; files on disk are untouched
    pub async fn clear(&self, worker_id: &str) {
        let log = self.logs.read().await.get(worker_id).cloned();
        if let Some(log) = log {
            log.buffer.lock().await.entries.clear();
        }
    }

    /// Drop all in-memory state for a deleted worker
    pub async fn forget(&self, worker_id: &str) {
        self.logs.write().await.remove(worker_id);
    }

    /// Daily log files on disk, newest first
    pub async fn list_log_files(&self, worker: &Worker) -> Result<Vec<LogFileInfo>> {
        let dir = self.log_dir(&worker.install_path);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HearthError::io(&worker.id, "list log files", e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| HearthError::io(&worker.id, "list log files", e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".log") {
                continue;
            }
            let Some(meta) = best_effort::soft_async(&worker.id, "stat log file", entry.metadata()).await
            else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            files.push(LogFileInfo {
                name,
                size: meta.len(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        // Date-stamped names sort chronologically.
        files.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(files)
    }
}
