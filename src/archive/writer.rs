//! Streaming archive writer.
//!
//! # Responsibilities
//! - Write the document preamble when started
//! - Accept entries from any number of producers without blocking them
//! - Serialize entries one at a time on a single background task
//! - Drain everything queued before closing the document on stop
//!
//! # State Transitions
//! ```text
//! New → Starting → Running → Stopping → Terminated
//! ```
//!
//! Entries submitted outside `Running` are discarded without error; late
//! submissions during shutdown are expected, not a defect.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::archive::error::ArchiveError;
use crate::archive::har::{HarCreator, HarEntry, WriteMode, HAR_VERSION, LIGHTWEIGHT_MARKER};
use crate::archive::model::ArchiveEntry;
use crate::config::ArchiveConfig;
use crate::observability::metrics;

/// Destination stream of an archive.
pub type ArchiveSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Writer lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    New = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Terminated = 4,
}

impl From<u8> for WriterState {
    fn from(val: u8) -> Self {
        match val {
            0 => WriterState::New,
            1 => WriterState::Starting,
            2 => WriterState::Running,
            3 => WriterState::Stopping,
            _ => WriterState::Terminated,
        }
    }
}

impl WriterState {
    fn name(self) -> &'static str {
        match self {
            WriterState::New => "new",
            WriterState::Starting => "starting",
            WriterState::Running => "running",
            WriterState::Stopping => "stopping",
            WriterState::Terminated => "terminated",
        }
    }
}

struct Shared {
    state: AtomicU8,
    /// Entries accepted but not yet serialized.
    pending: AtomicUsize,
    tx: mpsc::UnboundedSender<ArchiveEntry>,
    poll_interval: Duration,
}

impl Shared {
    fn state(&self) -> WriterState {
        WriterState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WriterState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Background service serializing archive entries to a JSON document.
pub struct ArchiveWriter {
    shared: Arc<Shared>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ArchiveEntry>>>,
    task: Mutex<Option<JoinHandle<Result<u64, ArchiveError>>>>,
    mode: WriteMode,
    creator: HarCreator,
}

impl ArchiveWriter {
    /// Create a writer in the `New` state.
    pub fn new(config: &ArchiveConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mode = WriteMode::from_lightweight(config.lightweight);
        let creator = HarCreator {
            name: config.creator_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            comment: (mode == WriteMode::Lightweight).then(|| LIGHTWEIGHT_MARKER.to_string()),
        };

        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(WriterState::New as u8),
                pending: AtomicUsize::new(0),
                tx,
                poll_interval: config.poll_interval(),
            }),
            rx: Mutex::new(Some(rx)),
            task: Mutex::new(None),
            mode,
            creator,
        }
    }

    /// Create the archive file at `config.path` and start writing to it.
    pub async fn create(config: &ArchiveConfig) -> Result<Self, ArchiveError> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&config.path).await?;
        let writer = Self::new(config);
        writer.start(Box::new(file)).await?;
        tracing::info!(path = %config.path.display(), lightweight = config.lightweight, "Archive opened");
        Ok(writer)
    }

    /// Write the preamble to `sink` and spawn the consumer task.
    pub async fn start(&self, sink: ArchiveSink) -> Result<(), ArchiveError> {
        let state = self.shared.state();
        if self
            .shared
            .state
            .compare_exchange(
                WriterState::New as u8,
                WriterState::Starting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(ArchiveError::NotStartable(state.name()));
        }

        let rx = self
            .rx
            .lock()
            .expect("writer receiver mutex poisoned")
            .take()
            .ok_or(ArchiveError::NotStartable("already started"))?;

        let mut sink = BufWriter::new(sink);
        if let Err(e) = write_preamble(&mut sink, &self.creator).await {
            self.shared.set_state(WriterState::Terminated);
            return Err(e);
        }

        self.shared.set_state(WriterState::Running);
        let task = tokio::spawn(run_loop(Arc::clone(&self.shared), rx, sink, self.mode));
        *self.task.lock().expect("writer task mutex poisoned") = Some(task);

        tracing::debug!(mode = ?self.mode, "Archive writer running");
        Ok(())
    }

    /// Queue an entry. Returns false when the writer is not running and the
    /// entry was discarded.
    pub fn submit(&self, entry: ArchiveEntry) -> bool {
        // Count first so a concurrent stop() waits for this entry.
        self.shared.pending.fetch_add(1, Ordering::SeqCst);

        let state = self.shared.state();
        if state != WriterState::Running {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(state = state.name(), "Archive writer not running, entry discarded");
            metrics::record_entry_discarded();
            return false;
        }

        if self.shared.tx.send(entry).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            metrics::record_entry_discarded();
            return false;
        }
        true
    }

    pub fn state(&self) -> WriterState {
        self.shared.state()
    }

    /// Entries accepted but not yet written.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting entries, drain the queue, close the document.
    ///
    /// Returns the number of entries written. Calling stop on a writer that
    /// never started, or a second time, returns `Ok(0)`.
    pub async fn stop(&self) -> Result<u64, ArchiveError> {
        match self.shared.state.compare_exchange(
            WriterState::Running as u8,
            WriterState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(current) => {
                if WriterState::from(current) == WriterState::New {
                    self.shared.set_state(WriterState::Terminated);
                }
                return Ok(0);
            }
        }

        tracing::info!(pending = self.pending(), "Archive writer stopping, draining queue");
        while self.shared.pending.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(self.shared.poll_interval).await;
        }

        let task = self.task.lock().expect("writer task mutex poisoned").take();
        let result = match task {
            Some(task) => task
                .await
                .map_err(|e| ArchiveError::Task(e.to_string()))
                .and_then(|r| r),
            None => Ok(0),
        };
        self.shared.set_state(WriterState::Terminated);

        match &result {
            Ok(written) => tracing::info!(entries = written, "Archive closed"),
            Err(e) => tracing::error!(error = %e, "Archive writer failed"),
        }
        result
    }
}

async fn write_preamble(
    sink: &mut BufWriter<ArchiveSink>,
    creator: &HarCreator,
) -> Result<(), ArchiveError> {
    let creator = serde_json::to_string(creator)?;
    let head = format!(
        "{{\"log\":{{\"version\":\"{}\",\"creator\":{},\"entries\":[",
        HAR_VERSION, creator
    );
    sink.write_all(head.as_bytes()).await?;
    sink.flush().await?;
    Ok(())
}

async fn write_entry(
    sink: &mut BufWriter<ArchiveSink>,
    entry: &ArchiveEntry,
    mode: WriteMode,
    first: bool,
) -> Result<(), ArchiveError> {
    let json = serde_json::to_vec(&HarEntry::from_entry(entry, mode))?;
    let separator: &[u8] = if first { b"\n" } else { b",\n" };
    sink.write_all(separator).await?;
    sink.write_all(&json).await?;
    Ok(())
}

async fn run_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<ArchiveEntry>,
    mut sink: BufWriter<ArchiveSink>,
    mode: WriteMode,
) -> Result<u64, ArchiveError> {
    let mut written = 0u64;
    let mut failure: Option<ArchiveError> = None;

    loop {
        match tokio::time::timeout(shared.poll_interval, rx.recv()).await {
            Ok(Some(entry)) => {
                if failure.is_none() {
                    match write_entry(&mut sink, &entry, mode, written == 0).await {
                        Ok(()) => {
                            written += 1;
                            metrics::record_entry_written();
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to write archive entry, later entries are dropped");
                            failure = Some(e);
                        }
                    }
                }
                shared.pending.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(None) => break,
            Err(_) => {
                if shared.state() == WriterState::Stopping
                    && shared.pending.load(Ordering::SeqCst) == 0
                {
                    break;
                }
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }

    sink.write_all(b"\n]}}\n").await?;
    sink.flush().await?;
    sink.shutdown().await?;
    Ok(written)
}
