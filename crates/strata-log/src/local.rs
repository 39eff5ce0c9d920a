//! Local-directory log: append-only segment files.
//!
//! All appends funnel through a single I/O thread fed by a bounded
//! channel. The thread drains whatever is queued (group commit), writes
//! the frames through a buffer of `buffer_size` bytes, syncs the segment,
//! and only then resolves each append's future with its assigned offset,
//! so durability precedes completion.
//!
//! The directory cannot push notifications, so subscriptions run in
//! polling mode with `poll_sleep_duration` as the idle backoff.
//!
//! On-disk frame layout, little-endian:
//! `[u32 frame length][i64 offset][i64 timestamp micros][payload]`
//! where the frame length counts everything after itself. A torn tail
//! frame is truncated away on open.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::clock::{Clock, SystemClock};
use crate::error::LogError;
use crate::log::TxLog;
use crate::record::{LogMessage, LogOffset, LogRecord, HEADER_TX};
use crate::subscription::{self, Subscriber, Subscription};

/// Segment files roll once they exceed this size.
const SEGMENT_ROLL_BYTES: u64 = 64 * 1024 * 1024;

/// Upper bound on appends drained into one group commit.
const MAX_GROUP_COMMIT: usize = 256;

/// Capacity of the append channel feeding the I/O thread.
const APPEND_QUEUE_CAPACITY: usize = 256;

/// Bytes of frame header after the length word: offset + timestamp.
const FRAME_HEADER_BYTES: usize = 16;

/// Configuration for [`LocalLog`].
#[derive(Debug, Clone)]
pub struct LocalLogConfig {
    /// Filesystem root for log segments.
    pub path: PathBuf,
    /// Append buffer size in bytes.
    pub buffer_size: usize,
    /// Idle backoff for polling subscriptions.
    pub poll_sleep_duration: Duration,
}

impl LocalLogConfig {
    /// Creates a configuration with defaults for everything but the path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer_size: 4096,
            poll_sleep_duration: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
struct SegmentMeta {
    first_offset: LogOffset,
    path: PathBuf,
}

struct AppendRequest {
    payload: Bytes,
    ack: oneshot::Sender<Result<LogOffset, LogError>>,
}

/// A durable log over append-only segment files.
pub struct LocalLog {
    config: LocalLogConfig,
    appender: Mutex<Option<mpsc::Sender<AppendRequest>>>,
    writer_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    /// Highest durable offset, `-1` while empty.
    latest: Arc<AtomicI64>,
    segments: Arc<RwLock<Vec<SegmentMeta>>>,
}

impl LocalLog {
    /// Opens (or creates) a log under `config.path` with the system clock.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the directory cannot be prepared or the
    /// existing segments cannot be recovered.
    pub fn open(config: LocalLogConfig) -> Result<Self, LogError> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Opens the log with an injected instant source.
    ///
    /// # Errors
    ///
    /// See [`LocalLog::open`].
    pub fn open_with_clock(
        config: LocalLogConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LogError> {
        fs::create_dir_all(&config.path)?;
        let mut segments = scan_segments(&config.path)?;
        let next_offset = recover_tail(&mut segments)?;

        if segments.is_empty() {
            let path = segment_path(&config.path, 0);
            File::create(&path)?.sync_all()?;
            segments.push(SegmentMeta {
                first_offset: 0,
                path,
            });
        }

        let latest = Arc::new(AtomicI64::new(next_offset - 1));
        let segments = Arc::new(RwLock::new(segments));
        let (tx, rx) = mpsc::channel(APPEND_QUEUE_CAPACITY);

        let writer = SegmentWriter::open(
            config.path.clone(),
            config.buffer_size,
            next_offset,
            Arc::clone(&latest),
            Arc::clone(&segments),
            clock,
        )?;
        let handle = std::thread::Builder::new()
            .name("strata-log-writer".into())
            .spawn(move || writer.run(rx))
            .map_err(LogError::Io)?;

        tracing::info!(path = %config.path.display(), next_offset, "local log opened");
        Ok(Self {
            config,
            appender: Mutex::new(Some(tx)),
            writer_thread: Mutex::new(Some(handle)),
            latest,
            segments,
        })
    }

    /// Stops the I/O thread after draining queued appends. Idempotent.
    pub async fn close(&self) {
        drop(self.appender.lock().take());
        let handle = self.writer_thread.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }

    async fn enqueue(&self, payload: Bytes) -> Result<LogOffset, LogError> {
        let sender = self.appender.lock().clone().ok_or(LogError::Closed)?;
        let (ack, done) = oneshot::channel();
        sender
            .send(AppendRequest { payload, ack })
            .await
            .map_err(|_| LogError::Closed)?;
        done.await.map_err(|_| LogError::Closed)?
    }
}

#[async_trait::async_trait]
impl TxLog for LocalLog {
    async fn append_tx(&self, payload: Bytes) -> Result<LogOffset, LogError> {
        if payload.first() != Some(&HEADER_TX) {
            return Err(LogError::Corrupt(
                "tx payload does not start with the record header".into(),
            ));
        }
        self.enqueue(payload).await
    }

    async fn append_message(&self, message: LogMessage) -> Result<LogOffset, LogError> {
        self.enqueue(message.encode()).await
    }

    async fn read_records(
        &self,
        after: Option<LogOffset>,
        max: usize,
    ) -> Result<Vec<LogRecord>, LogError> {
        let latest = self.latest.load(Ordering::Acquire);
        let first_wanted = after.map_or(0, |a| a + 1);
        if latest < 0 || first_wanted > latest {
            return Ok(Vec::new());
        }
        let segments = self.segments.read().clone();
        tokio::task::spawn_blocking(move || read_from_segments(&segments, first_wanted, max))
            .await
            .map_err(|e| {
                LogError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?
    }

    fn latest_submitted_offset(&self) -> Option<LogOffset> {
        let latest = self.latest.load(Ordering::Acquire);
        (latest >= 0).then_some(latest)
    }

    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber>) -> Subscription {
        let poll_sleep = self.config.poll_sleep_duration;
        subscription::spawn_polling(self, subscriber, poll_sleep)
    }
}

// ── I/O thread ─────────────────────────────────────────────────────

struct SegmentWriter {
    dir: PathBuf,
    buffer_size: usize,
    file: BufWriter<File>,
    segment_bytes: u64,
    next_offset: LogOffset,
    latest: Arc<AtomicI64>,
    segments: Arc<RwLock<Vec<SegmentMeta>>>,
    clock: Arc<dyn Clock>,
}

impl SegmentWriter {
    fn open(
        dir: PathBuf,
        buffer_size: usize,
        next_offset: LogOffset,
        latest: Arc<AtomicI64>,
        segments: Arc<RwLock<Vec<SegmentMeta>>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LogError> {
        let active = segments
            .read()
            .last()
            .expect("at least one segment")
            .path
            .clone();
        let file = OpenOptions::new().append(true).open(&active)?;
        let segment_bytes = file.metadata()?.len();
        Ok(Self {
            dir,
            buffer_size,
            file: BufWriter::with_capacity(buffer_size, file),
            segment_bytes,
            next_offset,
            latest,
            segments,
            clock,
        })
    }

    fn run(mut self, mut rx: mpsc::Receiver<AppendRequest>) {
        while let Some(first) = rx.blocking_recv() {
            let mut batch = vec![first];
            while batch.len() < MAX_GROUP_COMMIT {
                match rx.try_recv() {
                    Ok(req) => batch.push(req),
                    Err(_) => break,
                }
            }

            match self.commit(&batch) {
                Ok(first_offset) => {
                    #[allow(clippy::cast_possible_wrap)]
                    for (i, req) in batch.into_iter().enumerate() {
                        let _ = req.ack.send(Ok(first_offset + i as i64));
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "log append failed, stopping writer");
                    let msg = e.to_string();
                    for req in batch {
                        let _ = req.ack.send(Err(LogError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            msg.clone(),
                        ))));
                    }
                    // The segment tail may be torn; it will be truncated
                    // on the next open. Refuse further appends.
                    break;
                }
            }
        }
        let _ = self.file.flush();
        if let Ok(file) = self.file.into_inner() {
            let _ = file.sync_data();
        }
        tracing::debug!("log writer stopped");
    }

    /// Writes one group commit: frames, flush, sync, then advance the
    /// durable high-water mark. Returns the first assigned offset.
    fn commit(&mut self, batch: &[AppendRequest]) -> Result<LogOffset, LogError> {
        if self.segment_bytes >= SEGMENT_ROLL_BYTES {
            self.roll_segment()?;
        }

        let first_offset = self.next_offset;
        for req in batch {
            let offset = self.next_offset;
            let timestamp = self.clock.now().timestamp_micros();
            let frame_len = u32::try_from(FRAME_HEADER_BYTES + req.payload.len())
                .map_err(|_| LogError::Corrupt("record payload too large".into()))?;
            self.file.write_all(&frame_len.to_le_bytes())?;
            self.file.write_all(&offset.to_le_bytes())?;
            self.file.write_all(&timestamp.to_le_bytes())?;
            self.file.write_all(&req.payload)?;
            self.segment_bytes += u64::from(frame_len) + 4;
            self.next_offset += 1;
        }
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.latest
            .fetch_max(self.next_offset - 1, Ordering::AcqRel);
        Ok(first_offset)
    }

    fn roll_segment(&mut self) -> Result<(), LogError> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;

        let path = segment_path(&self.dir, self.next_offset);
        let file = File::create(&path)?;
        file.sync_all()?;
        self.segments.write().push(SegmentMeta {
            first_offset: self.next_offset,
            path: path.clone(),
        });
        tracing::debug!(path = %path.display(), first_offset = self.next_offset, "rolled log segment");

        self.file = BufWriter::with_capacity(self.buffer_size, file);
        self.segment_bytes = 0;
        Ok(())
    }
}

// ── segment files ──────────────────────────────────────────────────

fn segment_path(dir: &Path, first_offset: LogOffset) -> PathBuf {
    dir.join(format!("{first_offset:020}.seg"))
}

fn scan_segments(dir: &Path) -> Result<Vec<SegmentMeta>, LogError> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".seg") else {
            continue;
        };
        let Ok(first_offset) = stem.parse::<LogOffset>() else {
            tracing::warn!(file = name, "ignoring unrecognised file in log directory");
            continue;
        };
        segments.push(SegmentMeta { first_offset, path });
    }
    segments.sort_by_key(|s| s.first_offset);
    Ok(segments)
}

/// Scans the newest segment, truncating a torn tail frame, and returns
/// the next offset to assign.
fn recover_tail(segments: &mut [SegmentMeta]) -> Result<LogOffset, LogError> {
    let Some(last) = segments.last() else {
        return Ok(0);
    };

    let file = OpenOptions::new().read(true).write(true).open(&last.path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut good_end = 0u64;
    let mut last_offset: Option<LogOffset> = None;

    while let Some(frame) = read_frame(&mut reader)? {
        good_end += 4 + FRAME_HEADER_BYTES as u64 + frame.payload.len() as u64;
        last_offset = Some(frame.offset);
    }

    if good_end < file_len {
        tracing::warn!(
            path = %last.path.display(),
            torn_bytes = file_len - good_end,
            "truncating torn tail frame"
        );
        let file = reader.into_inner();
        file.set_len(good_end)?;
        file.sync_data()?;
    }

    Ok(last_offset.map_or(last.first_offset, |o| o + 1))
}

struct Frame {
    offset: LogOffset,
    timestamp_micros: i64,
    payload: Vec<u8>,
}

/// Reads one frame. Returns `None` at a clean end of file or at a partial
/// frame (which readers treat as not-yet-visible data).
fn read_frame(reader: &mut impl Read) -> Result<Option<Frame>, LogError> {
    let mut len_bytes = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_bytes)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Full => {}
    }
    let frame_len = u32::from_le_bytes(len_bytes) as usize;
    if frame_len < FRAME_HEADER_BYTES {
        return Err(LogError::Corrupt(format!(
            "frame length {frame_len} below header size"
        )));
    }
    let mut body = vec![0u8; frame_len];
    match read_exact_or_eof(reader, &mut body)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Full => {}
    }
    let offset = i64::from_le_bytes(body[0..8].try_into().expect("eight bytes"));
    let timestamp_micros = i64::from_le_bytes(body[8..16].try_into().expect("eight bytes"));
    Ok(Some(Frame {
        offset,
        timestamp_micros,
        payload: body.split_off(FRAME_HEADER_BYTES),
    }))
}

enum ReadOutcome {
    Full,
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome, LogError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

fn read_from_segments(
    segments: &[SegmentMeta],
    first_wanted: LogOffset,
    max: usize,
) -> Result<Vec<LogRecord>, LogError> {
    // Last segment whose first offset is not past the wanted one.
    let start_idx = segments
        .partition_point(|s| s.first_offset <= first_wanted)
        .saturating_sub(1);

    let mut records = Vec::with_capacity(max.min(128));
    for segment in &segments[start_idx..] {
        if records.len() >= max {
            break;
        }
        let mut reader = BufReader::new(File::open(&segment.path)?);
        while records.len() < max {
            let Some(frame) = read_frame(&mut reader)? else {
                break;
            };
            if frame.offset < first_wanted {
                continue;
            }
            let timestamp = chrono::DateTime::from_timestamp_micros(frame.timestamp_micros)
                .ok_or_else(|| LogError::Corrupt("timestamp out of range".into()))?;
            records.push(LogRecord {
                offset: frame.offset,
                timestamp,
                message: LogMessage::decode(Bytes::from(frame.payload))?,
            });
        }
    }
    Ok(records)
}
