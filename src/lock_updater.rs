//! Background worker refreshing the lock lease of every held event.
//!
//! One worker per registry batches all refreshes into a single store update
//! per wake, so store load does not scale with the number of concurrently
//! held events. The add/remove mailboxes are rendezvous channels: a send
//! completes only once the worker has taken the message, so by the time
//! event creation returns the target is in the heartbeat set, and a
//! finalizing caller knows its remove was observed before it touches the
//! store.

use std::collections::HashSet;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;

use crate::identity::Target;
use crate::repository::{Condition, EventRepository, FieldValue, Query, UpdateSet};

enum UpdaterMsg {
    Add(Target),
    Remove(Target),
    Stop,
}

struct UpdaterInner {
    tx: SyncSender<UpdaterMsg>,
    handle: JoinHandle<()>,
}

/// Singleton heartbeat task with guaranteed-once `start` and a `stop` that
/// re-arms `start`. The held-target set is owned by the worker thread and
/// mutated only through the mailboxes.
pub struct LockUpdater {
    repo: Arc<dyn EventRepository>,
    interval: Duration,
    inner: Mutex<Option<UpdaterInner>>,
}

impl LockUpdater {
    pub fn new(repo: Arc<dyn EventRepository>, interval: Duration) -> Self {
        Self {
            repo,
            interval,
            inner: Mutex::new(None),
        }
    }

    /// Spawn the worker thread if it is not already running.
    pub fn start(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.is_some() {
            return;
        }
        let (tx, rx) = mpsc::sync_channel(0);
        let repo = Arc::clone(&self.repo);
        let interval = self.interval;
        let handle = std::thread::spawn(move || {
            let mut held: HashSet<Target> = HashSet::new();
            loop {
                match rx.recv_timeout(interval) {
                    Ok(UpdaterMsg::Add(target)) => {
                        held.insert(target);
                    }
                    Ok(UpdaterMsg::Remove(target)) => {
                        held.remove(&target);
                    }
                    Ok(UpdaterMsg::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                if held.is_empty() {
                    continue;
                }
                let keys = held
                    .iter()
                    .map(|target| {
                        FieldValue::Str(crate::event::EventId::Target(target.clone()).storage_key())
                    })
                    .collect();
                let mut query = Query::new();
                query.push("_id", Condition::In(keys));
                let update = UpdateSet::new().set("lockupdatetime", FieldValue::Time(Utc::now()));
                if let Err(err) = repo.update_many(&query, &update) {
                    log::error!("[events] [lock update] error updating: {}", err);
                }
            }
        });
        *inner = Some(UpdaterInner { tx, handle });
    }

    /// Stop the worker and wait for it to exit. A later `start` re-initializes.
    pub fn stop(&self) {
        let taken = match self.inner.lock() {
            Ok(mut inner) => inner.take(),
            Err(_) => None,
        };
        if let Some(UpdaterInner { tx, handle }) = taken {
            let _ = tx.send(UpdaterMsg::Stop);
            let _ = handle.join();
        }
    }

    /// Register a held target. Returns once the worker has taken the message.
    pub fn add(&self, target: &Target) {
        self.send(UpdaterMsg::Add(target.clone()));
    }

    /// Deregister a held target. Returns once the worker has taken the message.
    pub fn remove(&self, target: &Target) {
        self.send(UpdaterMsg::Remove(target.clone()));
    }

    fn send(&self, msg: UpdaterMsg) {
        let tx = match self.inner.lock() {
            Ok(inner) => inner.as_ref().map(|i| i.tx.clone()),
            Err(_) => None,
        };
        if let Some(tx) = tx {
            let _ = tx.send(msg);
        }
    }
}

impl Drop for LockUpdater {
    fn drop(&mut self) {
        self.stop();
    }
}
