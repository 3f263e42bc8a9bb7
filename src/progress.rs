//! In-memory progress logs for running and recently finished tasks.
//!
//! Each task owns an append-only ordered list of [`ProgressEvent`]s. Readers
//! poll with [`ProgressStore::events_since`] or wait on the task's
//! [`Notify`] handle; the store never blocks writers on readers. Logs for
//! terminal tasks are kept for a grace period so late pollers still see the
//! final state, then purged on the next [`ProgressStore::expire`] call.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::PipelineError;
use crate::models::{ProgressEvent, TaskStatus};

struct TaskLog {
    events: Vec<ProgressEvent>,
    notify: Arc<Notify>,
    terminal_at: Option<Instant>,
}

/// Shared registry of per-task progress logs.
pub struct ProgressStore {
    inner: RwLock<HashMap<String, TaskLog>>,
    grace: Duration,
}

impl ProgressStore {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            grace,
        }
    }

    /// Registers an empty log for a new task.
    pub fn create(&self, task_id: &str) {
        let mut map = self.inner.write().unwrap();
        map.insert(
            task_id.to_string(),
            TaskLog {
                events: Vec::new(),
                notify: Arc::new(Notify::new()),
                terminal_at: None,
            },
        );
    }

    /// Appends an event to a task's log and wakes waiters.
    ///
    /// Percent is clamped to be non-decreasing within one task, except for
    /// error and cancelled events which keep their reported value.
    pub fn append(&self, mut event: ProgressEvent) -> Result<(), PipelineError> {
        let mut map = self.inner.write().unwrap();
        let log = map
            .get_mut(&event.task_id)
            .ok_or_else(|| PipelineError::UnknownTask(event.task_id.clone()))?;

        if !matches!(event.status, TaskStatus::Error | TaskStatus::Cancelled) {
            if let Some(last) = log.events.last() {
                if event.percent < last.percent {
                    event.percent = last.percent;
                }
            }
        }
        if event.status.is_terminal() {
            log.terminal_at = Some(Instant::now());
        }
        log.events.push(event);
        log.notify.notify_waiters();
        Ok(())
    }

    /// Latest event for a task, if any has been recorded.
    pub fn latest(&self, task_id: &str) -> Result<Option<ProgressEvent>, PipelineError> {
        let map = self.inner.read().unwrap();
        let log = map
            .get(task_id)
            .ok_or_else(|| PipelineError::UnknownTask(task_id.to_string()))?;
        Ok(log.events.last().cloned())
    }

    /// Events recorded after position `after` (0 returns everything).
    /// The returned offset is the new log length, for the next poll.
    pub fn events_since(
        &self,
        task_id: &str,
        after: usize,
    ) -> Result<(Vec<ProgressEvent>, usize), PipelineError> {
        let map = self.inner.read().unwrap();
        let log = map
            .get(task_id)
            .ok_or_else(|| PipelineError::UnknownTask(task_id.to_string()))?;
        let events = log.events.get(after..).unwrap_or_default().to_vec();
        Ok((events, log.events.len()))
    }

    /// Current snapshot plus a handle that is notified on every append.
    pub fn subscribe(
        &self,
        task_id: &str,
    ) -> Result<(Vec<ProgressEvent>, Arc<Notify>), PipelineError> {
        let map = self.inner.read().unwrap();
        let log = map
            .get(task_id)
            .ok_or_else(|| PipelineError::UnknownTask(task_id.to_string()))?;
        Ok((log.events.clone(), Arc::clone(&log.notify)))
    }

    /// Drops logs whose task reached a terminal state more than the grace
    /// period ago. Called opportunistically on submission, not from a
    /// background loop.
    pub fn expire(&self) {
        let mut map = self.inner.write().unwrap();
        let grace = self.grace;
        map.retain(|_, log| match log.terminal_at {
            Some(at) => at.elapsed() < grace,
            None => true,
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(task_id: &str, status: TaskStatus, percent: u8) -> ProgressEvent {
        ProgressEvent::new(task_id, status, percent, "msg", status.as_str())
    }

    #[test]
    fn append_to_unknown_task_fails() {
        let store = ProgressStore::new(Duration::from_secs(300));
        let err = store
            .append(event("nope", TaskStatus::Queued, 0))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownTask(_)));
    }

    #[test]
    fn percent_never_decreases_before_terminal() {
        let store = ProgressStore::new(Duration::from_secs(300));
        store.create("t");
        store.append(event("t", TaskStatus::Chunking, 25)).unwrap();
        store.append(event("t", TaskStatus::Generating, 20)).unwrap();
        let latest = store.latest("t").unwrap().unwrap();
        assert_eq!(latest.percent, 25);

        // Error events keep their own percent.
        store.append(event("t", TaskStatus::Error, 10)).unwrap();
        let latest = store.latest("t").unwrap().unwrap();
        assert_eq!(latest.percent, 10);
    }

    #[test]
    fn events_since_pages_through_the_log() {
        let store = ProgressStore::new(Duration::from_secs(300));
        store.create("t");
        store.append(event("t", TaskStatus::Queued, 0)).unwrap();
        store.append(event("t", TaskStatus::Parsing, 5)).unwrap();

        let (batch, offset) = store.events_since("t", 0).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(offset, 2);

        store.append(event("t", TaskStatus::Cleaning, 20)).unwrap();
        let (batch, offset) = store.events_since("t", offset).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, TaskStatus::Cleaning);
        assert_eq!(offset, 3);
    }

    #[test]
    fn expire_drops_only_terminal_logs() {
        let store = ProgressStore::new(Duration::ZERO);
        store.create("running");
        store.create("done");
        store
            .append(event("running", TaskStatus::Generating, 50))
            .unwrap();
        store
            .append(event("done", TaskStatus::Completed, 100))
            .unwrap();

        store.expire();
        assert_eq!(store.len(), 1);
        assert!(store.latest("running").is_ok());
        assert!(matches!(
            store.latest("done"),
            Err(PipelineError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn subscribe_sees_appends() {
        let store = Arc::new(ProgressStore::new(Duration::from_secs(300)));
        store.create("t");
        let (snapshot, notify) = store.subscribe("t").unwrap();
        assert!(snapshot.is_empty());

        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        store.append(event("t", TaskStatus::Queued, 0)).unwrap();
        notified.await;

        let (events, _) = store.events_since("t", 0).unwrap();
        assert_eq!(events.len(), 1);
    }
}
