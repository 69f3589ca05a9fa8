//! Subscriber registry and bounded, drop-newest event fan-out.
//!
//! Generalizes the one-shot `mpsc::channel` + `ReceiverStream` streaming
//! idiom used for single-RPC server streaming into a registry of
//! long-lived subscribers.

use crate::model::{FileEvent, FileEventKind};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

const QUEUE_CAPACITY: usize = 100;

pub struct Subscriber {
    pub id: Uuid,
    pub root: String,
    pub min_size: i64,
    excludes: GlobSet,
    sender: mpsc::Sender<FileEvent>,
}

/// A concurrent-safe registry of subscribers, each with its own bounded
/// channel. `notify` iterates subscribers under a read lock and performs a
/// non-blocking send per match — a full queue drops the event rather than
/// blocking the producer.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns its id plus the receiving
    /// half of its event queue.
    pub fn subscribe(
        &self,
        root: String,
        min_size: i64,
        excludes: &[String],
    ) -> Result<(Uuid, mpsc::Receiver<FileEvent>), globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in excludes {
            builder.add(Glob::new(pattern)?);
        }
        let excludes = builder.build()?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        let subscriber = Subscriber {
            id,
            root,
            min_size,
            excludes,
            sender: tx,
        };
        self.subscribers.write().unwrap().insert(id, subscriber);
        Ok((id, rx))
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.write().unwrap().remove(&id);
    }

    /// Dispatches one event to every matching subscriber: path under
    /// subscriber root; size filter exempted for deletions (`size == 0`);
    /// basename not excluded.
    pub fn notify(&self, event: FileEvent) {
        let subscribers = self.subscribers.read().unwrap();
        for sub in subscribers.values() {
            if !Self::matches(sub, &event) {
                continue;
            }
            if sub.sender.try_send(event.clone()).is_err() {
                // Full queue or closed receiver: drop-newest backpressure,
                // never block the producer.
                warn!(subscriber = %sub.id, "dropping event, subscriber queue full or closed");
            }
        }
    }

    fn matches(sub: &Subscriber, event: &FileEvent) -> bool {
        if !crate::model::is_path_under(&event.path, &sub.root) {
            return false;
        }
        if event.size > 0 && event.size < sub.min_size {
            return false;
        }
        let basename = crate::model::basename(&event.path);
        !sub.excludes.is_match(basename)
    }

    /// Drains and removes every subscriber, closing their queues. Called
    /// during daemon shutdown.
    pub fn close(&self) {
        self.subscribers.write().unwrap().clear();
    }
}

pub fn event(kind: FileEventKind, path: impl Into<String>, size: i64, mtime: i64) -> FileEvent {
    FileEvent {
        kind,
        path: path.into(),
        size,
        mtime,
    }
}
