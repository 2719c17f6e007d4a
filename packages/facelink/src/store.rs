// Result store
//
// Latest result per stage, each cleared automatically once it has been held
// for the TTL without being replaced. All writes go through one actor task;
// readers get the published snapshot from a watch channel and never wait on
// the actor.
//
// Every `put` arms its own expiry entry. When an entry fires it only clears
// the slot if the slot still holds that exact result (pointer identity), so a
// stale timer can never erase a newer result.

use crate::types::{PipelineResult, Stage, Task};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::time::DelayQueue;
use tracing::{debug, trace};

/// Read model for one stage
#[derive(Debug, Clone, Default)]
pub struct StageSlot {
    pub current: Option<Arc<PipelineResult>>,
    /// Last failure reported for this stage; cleared by the next `put`
    pub last_error: Option<String>,
}

/// Snapshot of every stage, as published after each applied write
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    slots: [StageSlot; 2],
}

impl StoreSnapshot {
    pub fn slot(&self, stage: Stage) -> &StageSlot {
        &self.slots[stage.index()]
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<PipelineResult>> {
        self.slot(stage).current.as_ref()
    }

    pub fn last_error(&self, stage: Stage) -> Option<&str> {
        self.slot(stage).last_error.as_deref()
    }

    fn slot_mut(&mut self, stage: Stage) -> &mut StageSlot {
        &mut self.slots[stage.index()]
    }
}

#[derive(Debug)]
enum StoreCommand {
    Put(Arc<PipelineResult>),
    RecordError { stage: Stage, message: String },
    Sync(oneshot::Sender<()>),
}

/// Handle to the result store actor. Cheap to clone.
///
/// The actor stops once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct ResultStore {
    command_tx: mpsc::UnboundedSender<StoreCommand>,
    snapshot_rx: watch::Receiver<StoreSnapshot>,
    ttl: Duration,
}

impl ResultStore {
    /// Spawn the store actor. Must be called from within a tokio runtime.
    pub fn new(ttl: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(StoreSnapshot::default());

        tokio::spawn(StoreActor::new(ttl, snapshot_tx).run(command_rx));

        Self {
            command_tx,
            snapshot_rx,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Replace the result for `stage` and arm its expiry.
    ///
    /// Last write wins; no reordering by task timestamp. Returns the stored
    /// instance.
    pub fn put(&self, stage: Stage, task: Task) -> Arc<PipelineResult> {
        let result = Arc::new(PipelineResult::new(stage, task));
        if self.command_tx.send(StoreCommand::Put(result.clone())).is_err() {
            debug!("Result store stopped, dropping {} result", stage);
        }
        result
    }

    /// Record a failure for `stage` without touching its current result
    pub fn record_error(&self, stage: Stage, message: impl Into<String>) {
        let _ = self.command_tx.send(StoreCommand::RecordError {
            stage,
            message: message.into(),
        });
    }

    /// Current result for `stage`, if any. Never blocks.
    pub fn read(&self, stage: Stage) -> Option<Arc<PipelineResult>> {
        self.snapshot_rx.borrow().get(stage).cloned()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until every write queued before this call has been applied
    pub async fn settled(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(StoreCommand::Sync(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct StoreActor {
    ttl: Duration,
    snapshot_tx: watch::Sender<StoreSnapshot>,
    expiries: DelayQueue<Arc<PipelineResult>>,
}

impl StoreActor {
    fn new(ttl: Duration, snapshot_tx: watch::Sender<StoreSnapshot>) -> Self {
        Self {
            ttl,
            snapshot_tx,
            expiries: DelayQueue::new(),
        }
    }

    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<StoreCommand>) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                Some(expired) = self.expiries.next(), if !self.expiries.is_empty() => {
                    self.expire(expired.into_inner());
                }
            }
        }

        debug!("Result store actor stopped");
    }

    fn apply(&mut self, command: StoreCommand) {
        match command {
            StoreCommand::Put(result) => {
                let stage = result.stage;
                self.expiries.insert(result.clone(), self.ttl);
                self.snapshot_tx.send_modify(|snapshot| {
                    let slot = snapshot.slot_mut(stage);
                    slot.current = Some(result);
                    slot.last_error = None;
                });
                trace!("Stored {} result", stage);
            }
            StoreCommand::RecordError { stage, message } => {
                self.snapshot_tx.send_modify(|snapshot| {
                    snapshot.slot_mut(stage).last_error = Some(message);
                });
            }
            StoreCommand::Sync(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn expire(&mut self, armed_for: Arc<PipelineResult>) {
        let stage = armed_for.stage;
        self.snapshot_tx.send_if_modified(|snapshot| {
            let slot = snapshot.slot_mut(stage);
            match &slot.current {
                Some(current) if Arc::ptr_eq(current, &armed_for) => {
                    slot.current = None;
                    trace!("Expired {} result", stage);
                    true
                }
                _ => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectionBox;

    const TTL: Duration = Duration::from_millis(2000);

    fn task(x: f64) -> Task {
        Task::from_detection(DetectionBox::new(x, x, x + 10.0, x + 10.0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_then_read_until_ttl() {
        let store = ResultStore::new(TTL);
        let stored = store.put(Stage::Stage1, task(1.0));
        store.settled().await;

        let read = store.read(Stage::Stage1).unwrap();
        assert!(Arc::ptr_eq(&read, &stored));
        assert!(store.read(Stage::Stage2).is_none());

        tokio::time::sleep(Duration::from_millis(1990)).await;
        store.settled().await;
        assert!(store.read(Stage::Stage1).is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.settled().await;
        assert!(store.read(Stage::Stage1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_clear_newer_result() {
        let store = ResultStore::new(TTL);
        store.put(Stage::Stage1, task(1.0));
        store.settled().await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let newer = store.put(Stage::Stage1, task(2.0));
        store.settled().await;

        // First put's timer fires here
        tokio::time::sleep(Duration::from_millis(600)).await;
        store.settled().await;
        let read = store.read(Stage::Stage1).unwrap();
        assert!(Arc::ptr_eq(&read, &newer));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        store.settled().await;
        assert!(store.read(Stage::Stage1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_tasks_are_still_distinct_instances() {
        let store = ResultStore::new(TTL);
        let same = task(3.0);
        store.put(Stage::Stage2, same.clone());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let second = store.put(Stage::Stage2, same);
        store.settled().await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        store.settled().await;
        assert!(Arc::ptr_eq(&store.read(Stage::Stage2).unwrap(), &second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_is_idempotent() {
        let store = ResultStore::new(TTL);
        store.put(Stage::Stage2, task(4.0));
        store.settled().await;

        let a = store.read(Stage::Stage2).unwrap();
        let b = store.read(Stage::Stage2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.task, b.task);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_wins_in_arrival_order() {
        let store = ResultStore::new(TTL);
        let mut older = task(5.0);
        older.timestamp = Some("2020-01-01T00:00:00Z".to_string());
        let mut newer = task(6.0);
        newer.timestamp = Some("2030-01-01T00:00:00Z".to_string());

        store.put(Stage::Stage1, newer);
        store.put(Stage::Stage1, older.clone());
        store.settled().await;

        assert_eq!(store.read(Stage::Stage1).unwrap().task, older);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_cleared_by_next_put() {
        let store = ResultStore::new(TTL);
        store.record_error(Stage::Stage1, "detection timed out");
        store.settled().await;
        assert_eq!(
            store.snapshot().last_error(Stage::Stage1),
            Some("detection timed out")
        );
        assert!(store.snapshot().last_error(Stage::Stage2).is_none());

        store.put(Stage::Stage1, task(7.0));
        store.settled().await;
        assert!(store.snapshot().last_error(Stage::Stage1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_expiry() {
        let store = ResultStore::new(TTL);
        let mut rx = store.subscribe();
        store.put(Stage::Stage1, task(8.0));

        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().get(Stage::Stage1).is_some());

        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().get(Stage::Stage1).is_none());
    }
}
