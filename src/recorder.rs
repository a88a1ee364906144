//! Session recording: every event from every session appended to a JSON
//! Lines file, one [`RecordLine`] per line, and read back for replay.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::protocol::{WireBody, WireEvent};
use crate::broker::{Broker, SubscriberQueue, Subscription};
use crate::event::{Payload, SessionId, StreamEvent};

pub const FORMAT_VERSION: u32 = 1;

/// Buffered lines reach the file at least this often.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to open recording {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write recording {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: invalid record: {source}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("recorder task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One line of a recording file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordLine {
    Metadata {
        version: u32,
        started_at: DateTime<Utc>,
        /// Last sequence number published before recording began.
        start_seq: u64,
    },
    Event {
        entry: WireEvent,
    },
    End {
        ended_at: DateTime<Utc>,
        events: u64,
    },
}

#[derive(Debug, Clone)]
pub struct RecordingOptions {
    pub path: PathBuf,
    /// Record what clients typed as well as what the sessions printed.
    pub include_input: bool,
}

/// A running recording. Appends to the file until [`stop`](Self::stop).
pub struct Recorder {
    broker: Broker,
    subscription: Subscription,
    task: JoinHandle<Result<u64, RecorderError>>,
}

impl Recorder {
    /// Open `options.path` for appending and subscribe to every session.
    pub async fn start(broker: &Broker, options: RecordingOptions) -> Result<Self, RecorderError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&options.path)
            .await
            .map_err(|source| RecorderError::Open {
                path: options.path.clone(),
                source,
            })?;
        let (queue, rx) = SubscriberQueue::unbounded();
        let (subscription, start_seq) = broker.subscribe_all(queue);
        tracing::info!(path = %options.path.display(), start_seq, "recording sessions");
        let task = tokio::spawn(write_loop(BufWriter::new(file), rx, options, start_seq));
        Ok(Self {
            broker: broker.clone(),
            subscription,
            task,
        })
    }

    /// Stop recording, write the end marker and flush. Returns how many
    /// events were written.
    pub async fn stop(self) -> Result<u64, RecorderError> {
        self.broker.unsubscribe(&self.subscription);
        self.task.await?
    }
}

struct Sink {
    out: BufWriter<File>,
    path: PathBuf,
}

impl Sink {
    async fn write(&mut self, line: &RecordLine) -> Result<(), RecorderError> {
        // Serializing our own types cannot fail.
        let mut json = serde_json::to_vec(line).unwrap_or_default();
        json.push(b'\n');
        self.out.write_all(&json).await.map_err(|e| self.error(e))
    }

    async fn flush(&mut self) -> Result<(), RecorderError> {
        self.out.flush().await.map_err(|e| self.error(e))
    }

    fn error(&self, source: std::io::Error) -> RecorderError {
        RecorderError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

async fn write_loop(
    out: BufWriter<File>,
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    options: RecordingOptions,
    start_seq: u64,
) -> Result<u64, RecorderError> {
    let mut sink = Sink {
        out,
        path: options.path,
    };
    sink.write(&RecordLine::Metadata {
        version: FORMAT_VERSION,
        started_at: Utc::now(),
        start_seq,
    })
    .await?;

    let mut events = 0u64;
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if !options.include_input && matches!(event.payload, Payload::Input(_)) {
                    continue;
                }
                let line = RecordLine::Event { entry: WireEvent::from(&event) };
                if let Err(e) = sink.write(&line).await {
                    tracing::error!(error = %e, "recording stopped");
                    return Err(e);
                }
                events += 1;
            }
            _ = ticker.tick() => sink.flush().await?,
        }
    }

    sink.write(&RecordLine::End {
        ended_at: Utc::now(),
        events,
    })
    .await?;
    sink.flush().await?;
    tracing::info!(path = %sink.path.display(), events, "recording finished");
    Ok(events)
}

/// Parse a recording file. Blank lines are skipped.
pub fn read_recording(path: &Path) -> Result<Vec<RecordLine>, RecorderError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RecorderError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| RecorderError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}

/// The output chunks of a recording in order, with the time each was
/// published. `session` narrows it to one session.
pub fn playback(lines: &[RecordLine], session: Option<SessionId>) -> Vec<(DateTime<Utc>, Bytes)> {
    lines
        .iter()
        .filter_map(|line| match line {
            RecordLine::Event { entry } => Some(entry),
            _ => None,
        })
        .filter(|entry| session.map_or(true, |id| entry.session_id == id))
        .filter_map(|entry| match &entry.body {
            WireBody::Output(data) => match data.encoding.decode(&data.data) {
                Ok(bytes) => Some((entry.timestamp, bytes)),
                Err(e) => {
                    tracing::warn!(seq = entry.seq, error = %e, "skipping undecodable output");
                    None
                }
            },
            _ => None,
        })
        .collect()
}
