//! Log Fan-out: one append-only stream per build, multiplexed to any
//! number of live subscribers plus durable on-disk plain-text and JSONL
//! files.
//!
//! Built around a bounded `mpsc::channel` per subscriber with `try_send`
//! and drop-and-count on `Full`, registered in a set that can grow and
//! shrink over a build's lifetime.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::{LogLine, LogStream};

/// Each subscriber's channel holds at least a few hundred lines before a
/// slow reader starts getting dropped lines.
const SUBSCRIBER_CAPACITY: usize = 512;

pub type SubscriberId = u64;

#[derive(Clone, Debug)]
pub enum FanoutMessage {
    Line(LogLine),
    /// Sent once, after which no further messages arrive for this
    /// subscription.
    End,
}

#[derive(Serialize)]
struct JsonlLine<'a> {
    ts: i64,
    stream: &'a str,
    msg: &'a str,
}

struct Subscriber {
    tx: mpsc::Sender<FanoutMessage>,
}

struct Inner {
    subscribers: HashMap<SubscriberId, Subscriber>,
    closed: bool,
    next_id: u64,
}

/// Live fan-out plus durable backing files for one build. Only the
/// Runner that owns the build writes; any number of callers may subscribe
/// or unsubscribe concurrently.
pub struct LogFanout {
    inner: Mutex<Inner>,
    plain_path: PathBuf,
    jsonl_path: PathBuf,
    plain_file: Mutex<std::fs::File>,
    jsonl_file: Mutex<std::fs::File>,
    dropped_total: AtomicU64,
}

impl LogFanout {
    pub fn create(build_dir: &std::path::Path) -> std::io::Result<Self> {
        let plain_path = build_dir.join("build-log.txt");
        let jsonl_path = build_dir.join("build-log.jsonl");
        let plain_file = std::fs::OpenOptions::new().create(true).append(true).open(&plain_path)?;
        let jsonl_file = std::fs::OpenOptions::new().create(true).append(true).open(&jsonl_path)?;
        Ok(Self {
            inner: Mutex::new(Inner { subscribers: HashMap::new(), closed: false, next_id: 0 }),
            plain_path,
            jsonl_path,
            plain_file: Mutex::new(plain_file),
            jsonl_file: Mutex::new(jsonl_file),
            dropped_total: AtomicU64::new(0),
        })
    }

    /// Append one line: persist to both on-disk forms, then forward to
    /// every live subscriber. Called by exactly one producer (the Runner
    /// owning this build).
    pub fn write(&self, stream: LogStream, text: &str, timestamp: i64) {
        let line = LogLine { stream, timestamp, text: text.to_string() };

        {
            let mut f = self.plain_file.lock().unwrap();
            let _ = writeln!(f, "{text}");
        }
        {
            let mut f = self.jsonl_file.lock().unwrap();
            let record = JsonlLine { ts: timestamp, stream: &stream.to_string(), msg: text };
            if let Ok(encoded) = serde_json::to_string(&record) {
                let _ = writeln!(f, "{encoded}");
            }
        }

        let mut inner = self.inner.lock().unwrap();
        let mut dead = Vec::new();
        for (id, sub) in inner.subscribers.iter() {
            match sub.tx.try_send(FanoutMessage::Line(line.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(subscriber = id, "log subscriber too slow, dropping line");
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            inner.subscribers.remove(&id);
        }
    }

    /// Attach a new subscriber. If the log already has on-disk content
    /// (it always does once `create` succeeded), historical lines are
    /// replayed from disk up to the current offset before the live
    /// channel takes over, and a terminal build's subscriber reads to EOF
    /// and gets `End` immediately.
    ///
    /// Backlog is enqueued into the subscriber's channel *before* it is
    /// added to the live subscriber set, and both happen while `inner` is
    /// held -- otherwise a `write()` racing this call could land its line
    /// in the channel ahead of the backlog replay, breaking the "every
    /// subscriber sees lines in the order they were written" guarantee.
    pub fn subscribe(&self) -> mpsc::Receiver<FanoutMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        let backlog = self.read_backlog();
        for line in backlog {
            // Capacity is sized generously; a backlog that doesn't fit is
            // truncated rather than blocking the caller, same trade-off as
            // the live-write backpressure policy below.
            if tx.try_send(FanoutMessage::Line(line)).is_err() {
                break;
            }
        }

        if inner.closed {
            let _ = tx.try_send(FanoutMessage::End);
        } else {
            inner.subscribers.insert(id, Subscriber { tx });
        }

        rx
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.lock().unwrap().subscribers.remove(&id);
    }

    /// Flush buffered lines to every still-attached subscriber, then
    /// signal end-of-stream and stop accepting new subscribers into the
    /// live set.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        for (_, sub) in inner.subscribers.drain() {
            let _ = sub.tx.try_send(FanoutMessage::End);
        }
    }

    fn read_backlog(&self) -> Vec<LogLine> {
        let Ok(text) = std::fs::read_to_string(&self.jsonl_path) else {
            return Vec::new();
        };
        text.lines()
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .filter_map(|v| {
                let ts = v.get("ts")?.as_i64()?;
                let stream = v.get("stream")?.as_str()?;
                let msg = v.get("msg")?.as_str()?;
                let stream = match stream {
                    "stdout" => LogStream::Stdout,
                    "stderr" => LogStream::Stderr,
                    _ => LogStream::Meta,
                };
                Some(LogLine { stream, timestamp: ts, text: msg.to_string() })
            })
            .collect()
    }

    pub fn plain_path(&self) -> &std::path::Path {
        &self.plain_path
    }

    pub fn jsonl_path(&self) -> &std::path::Path {
        &self.jsonl_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fanout = LogFanout::create(dir.path()).unwrap();
        let mut rx = fanout.subscribe();
        fanout.write(LogStream::Meta, "first", 1);
        fanout.write(LogStream::Stdout, "second", 2);
        fanout.close();

        let mut seen = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                FanoutMessage::Line(l) => seen.push(l.text),
                FanoutMessage::End => break,
            }
        }
        assert_eq!(seen, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn late_subscriber_gets_backfill_then_end_on_terminal_build() {
        let dir = tempfile::tempdir().unwrap();
        let fanout = LogFanout::create(dir.path()).unwrap();
        fanout.write(LogStream::Meta, "early line", 1);
        fanout.close();

        let mut rx = fanout.subscribe();
        let first = rx.recv().await.unwrap();
        match first {
            FanoutMessage::Line(l) => assert_eq!(l.text, "early line"),
            FanoutMessage::End => panic!("expected backlog line first"),
        }
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, FanoutMessage::End));
    }
}
