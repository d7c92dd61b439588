use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ExperimentError, Result};
use crate::model::{ExitedReason, RequestId};
use crate::state::State;

/// What happened inside the searcher, as exposed to an external searcher
/// process driving a custom search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SearcherEventKind {
    InitialOperations,
    TrialCreated {
        request_id: RequestId,
    },
    ValidationCompleted {
        request_id: RequestId,
        metric: Value,
        validate_after: u64,
    },
    TrialProgress {
        request_id: RequestId,
        partial_units: f64,
    },
    TrialExitedEarly {
        request_id: RequestId,
        reason: ExitedReason,
    },
    TrialClosed {
        request_id: RequestId,
    },
    ExperimentStateChanged {
        state: State,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherEvent {
    pub id: u64,
    #[serde(flatten)]
    pub kind: SearcherEventKind,
}

/// Handle returned by `watch`: a stream of event batches plus the id used to
/// unregister the watcher.
#[derive(Debug)]
pub struct EventWatcher {
    pub id: Uuid,
    pub rx: mpsc::UnboundedReceiver<Vec<SearcherEvent>>,
}

/// Serializable portion of the queue, carried inside the searcher snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueState {
    events: VecDeque<SearcherEvent>,
    next_id: u64,
}

/// FIFO of searcher events with monotonically increasing ids and a set of
/// live watchers. Watchers receive the current backlog on registration and
/// every event enqueued afterwards; they are not persisted.
#[derive(Debug)]
pub struct SearcherEventQueue {
    events: VecDeque<SearcherEvent>,
    next_id: u64,
    watchers: HashMap<Uuid, mpsc::UnboundedSender<Vec<SearcherEvent>>>,
}

impl Default for SearcherEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SearcherEventQueue {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            watchers: HashMap::new(),
        }
    }

    /// Append an event, assigning it the next id, and fan it out to live
    /// watchers. Watchers whose receiver is gone are dropped.
    pub fn enqueue(&mut self, kind: SearcherEventKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let event = SearcherEvent { id, kind };
        self.events.push_back(event.clone());
        self.watchers
            .retain(|_, tx| tx.send(vec![event.clone()]).is_ok());
        id
    }

    /// Drop every event with `id <= up_to`. The id must name an event still
    /// in the queue.
    pub fn remove_up_to(&mut self, up_to: u64) -> Result<()> {
        match self.events.iter().position(|e| e.id == up_to) {
            Some(idx) => {
                self.events.drain(..=idx);
                Ok(())
            }
            None => Err(ExperimentError::internal(format!(
                "event {up_to} not found"
            ))),
        }
    }

    /// Register a watcher. The current backlog, if any, is delivered
    /// immediately as one batch.
    pub fn watch(&mut self) -> EventWatcher {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.events.is_empty() {
            let _ = tx.send(self.events.iter().cloned().collect());
        }
        self.watchers.insert(id, tx);
        EventWatcher { id, rx }
    }

    pub fn unwatch(&mut self, id: Uuid) {
        self.watchers.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &SearcherEvent> {
        self.events.iter()
    }

    pub fn save(&self) -> QueueState {
        QueueState {
            events: self.events.clone(),
            next_id: self.next_id,
        }
    }

    pub fn load(state: QueueState) -> Self {
        Self {
            events: state.events,
            next_id: state.next_id,
            watchers: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(queue: &mut SearcherEventQueue) -> u64 {
        queue.enqueue(SearcherEventKind::TrialCreated {
            request_id: RequestId::new(),
        })
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let mut q = SearcherEventQueue::new();
        assert_eq!(created(&mut q), 1);
        assert_eq!(created(&mut q), 2);
        assert_eq!(created(&mut q), 3);
    }

    #[test]
    fn test_remove_up_to_drops_prefix() {
        let mut q = SearcherEventQueue::new();
        for _ in 0..4 {
            created(&mut q);
        }
        q.remove_up_to(2).unwrap();
        let remaining: Vec<u64> = q.events().map(|e| e.id).collect();
        assert_eq!(remaining, vec![3, 4]);
    }

    #[test]
    fn test_remove_up_to_unknown_id_errors() {
        let mut q = SearcherEventQueue::new();
        created(&mut q);
        assert!(q.remove_up_to(9).is_err());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_watcher_receives_backlog_then_live_events() {
        let mut q = SearcherEventQueue::new();
        created(&mut q);
        created(&mut q);

        let mut w = q.watch();
        let backlog = w.rx.recv().await.unwrap();
        assert_eq!(backlog.len(), 2);

        created(&mut q);
        let live = w.rx.recv().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, 3);
    }

    #[tokio::test]
    async fn test_unwatch_stops_delivery() {
        let mut q = SearcherEventQueue::new();
        let w = q.watch();
        q.unwatch(w.id);
        created(&mut q);
        let mut rx = w.rx;
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut q = SearcherEventQueue::new();
        created(&mut q);
        created(&mut q);
        q.remove_up_to(1).unwrap();

        let restored = SearcherEventQueue::load(q.save());
        let ids: Vec<u64> = restored.events().map(|e| e.id).collect();
        assert_eq!(ids, vec![2]);
        let mut restored = restored;
        assert_eq!(created(&mut restored), 3);
    }
}
