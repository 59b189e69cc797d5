//! # History Scheduler
//!
//! Serializes `execute` / `undo` / `redo` from any number of callers into one
//! worker task that owns the timeline.
//!
//! ```text
//!  execute(op) ──┐                    ┌──────────────┐
//!  undo()     ───┼─► pending queue ──►│ worker loop  │──► handlers
//!  redo()     ───┘   (FIFO)           │ (one at once)│
//!                                     └──────┬───────┘
//!                  history ◄─────────────────┤
//!                  undo stack ◄──────────────┘
//! ```
//!
//! Every call does its bookkeeping synchronously, under the state lock,
//! before returning a [`Completion`]: `execute` pushes into history right
//! away, so an `undo` issued before the worker catches up still finds the
//! operation. `undo` / `redo` then look at where the operation is:
//!
//! - **Executing**: the in-flight item's cancellation token fires. The
//!   handler keeps running (it may watch [`Operation::cancellation`] and wrap
//!   up early); once it returns the worker runs `cancel(op, running_verb)` to
//!   completion and only then frees the slot.
//! - **Pending**: the queued item is rejected with `Cancelled` and a
//!   `cancel(op, None)` item takes its place in the queue.
//! - **Completed**: the follow-up verb is queued.
//!
//! Every `execute` stamps its operation with the next timeline position. A
//! failed undo puts its operation back into history at that position; a
//! failed redo returns to the undo stack only if nothing was executed since.
//!
//! The state lock is never held across an await.

use crate::completion::{Completion, Responder};
use crate::config::HistoryConfig;
use crate::errors::HistoryError;
use crate::events::HistoryEvent;
use crate::executor::{self, drive, Step};
use crate::operation::{OpState, Operation, OperationId, OperationRef};
use crate::registry::{BehaviorRegistry, Verb};
use crate::ring_buffer::RingBuffer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a queued work item will do with its operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Execute,
    Undo,
    Redo,
    /// Stands in for a queued item that was cancelled before it started
    Cancel,
}

impl Task {
    fn step(self) -> Step {
        match self {
            Task::Execute => Step::Execute,
            Task::Undo => Step::Undo,
            Task::Redo => Step::Redo,
            Task::Cancel => Step::Cancel(None),
        }
    }

    /// Verb reported to `cancel` when this task is interrupted
    fn running_verb(self) -> Option<Verb> {
        match self {
            Task::Execute | Task::Redo => Some(Verb::Execute),
            Task::Undo => Some(Verb::Undo),
            Task::Cancel => None,
        }
    }
}

struct WorkItem {
    op: OperationRef,
    task: Task,
    done: Responder,
    /// Timeline position when the item was queued
    issued_at: u64,
}

struct InFlight {
    op: OperationRef,
    task: Task,
    /// Taken and fired by whoever cancels; `None` for stand-in cancel items
    token: Option<CancellationToken>,
    /// Settled once `cancel` has run
    canceller: Option<Responder>,
}

struct SchedulerState {
    history: RingBuffer<OperationRef>,
    undo_stack: Vec<OperationRef>,
    pending: VecDeque<WorkItem>,
    in_flight: Option<InFlight>,
    /// Last timeline position handed out by `execute`
    sequence: u64,
    closed: bool,
}

impl SchedulerState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    /// Placement of `op`; a queued stand-in cancel does not count as pending work
    fn locate(&self, op: &Operation) -> OpState {
        let counts = |candidate: &OperationRef, task: Task| **candidate == *op && task != Task::Cancel;

        if self
            .in_flight
            .as_ref()
            .map_or(false, |flight| counts(&flight.op, flight.task))
        {
            OpState::Executing
        } else if self.pending.iter().any(|item| counts(&item.op, item.task)) {
            OpState::Pending
        } else {
            OpState::Completed
        }
    }

    fn remove_from_undo_stack(&mut self, op: &OperationRef) -> bool {
        match self.undo_stack.iter().rposition(|candidate| candidate == op) {
            Some(index) => {
                self.undo_stack.remove(index);
                true
            }
            None => false,
        }
    }

    /// Undo stack entries run newest → oldest from the bottom
    fn restore_undo(&mut self, op: OperationRef) {
        let index = self
            .undo_stack
            .iter()
            .filter(|other| other.sequence() > op.sequence())
            .count();
        self.undo_stack.insert(index, op);
    }
}

enum Outcome {
    Finished,
    /// Carries the canceller's responder
    Cancelled(Option<Responder>),
}

struct Shared {
    registry: Arc<BehaviorRegistry>,
    state: Mutex<SchedulerState>,
    /// Work was queued
    wake: Notify,
    /// The queue drained
    idle: Notify,
    events: broadcast::Sender<HistoryEvent>,
}

impl Shared {
    fn emit(&self, event: HistoryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn push_history(&self, state: &mut SchedulerState, op: OperationRef) {
        if let Some(evicted) = state.history.push(op) {
            tracing::debug!("History full, evicting {}", evicted.id());
            self.emit(HistoryEvent::Evicted { op: evicted.id() });
        }
    }

    /// Put `op` back between the operations executed before and after it
    fn restore_history(&self, state: &mut SchedulerState, op: OperationRef) {
        let index = state
            .history
            .iter()
            .filter(|other| other.sequence() < op.sequence())
            .count();
        if let Some(evicted) = state.history.insert(index, op) {
            tracing::debug!("History full, evicting {}", evicted.id());
            self.emit(HistoryEvent::Evicted { op: evicted.id() });
        }
    }

    fn wipe(&self, state: &mut SchedulerState, reason: &HistoryError) {
        tracing::error!(
            "Discarding {} history and {} redo entries: {}",
            state.history.len(),
            state.undo_stack.len(),
            reason
        );
        state.history.clear();
        state.undo_stack.clear();
        self.emit(HistoryEvent::Cleared);
    }

    fn enqueue(&self, state: &mut SchedulerState, op: OperationRef, task: Task) -> Completion {
        let (done, completion) = Completion::channel();
        tracing::debug!("Queueing {:?} for {}", task, op.id());
        let issued_at = state.sequence;
        state.pending.push_back(WorkItem {
            op,
            task,
            done,
            issued_at,
        });
        completion
    }

    /// Take back `op` that was just moved between history and the undo stack
    fn retract(&self, state: &mut SchedulerState, op: OperationRef, follow_up: Task) -> Completion {
        match state.locate(&op) {
            OpState::Executing => {
                if let Some(flight) = state.in_flight.as_mut() {
                    if let Some(token) = flight.token.take() {
                        tracing::info!("Cancelling {} while it runs {:?}", op.id(), flight.task.running_verb());
                        token.cancel();
                        let (ack, completion) = Completion::channel();
                        flight.canceller = Some(ack);
                        return completion;
                    }
                }

                // Already being cancelled: run the follow-up once that settles
                self.enqueue(state, op, follow_up)
            }
            OpState::Pending => {
                let index = state
                    .pending
                    .iter()
                    .rposition(|item| item.op == op && item.task != Task::Cancel);

                match index {
                    Some(index) => {
                        let (done, completion) = Completion::channel();
                        let issued_at = state.sequence;
                        let dropped = std::mem::replace(
                            &mut state.pending[index],
                            WorkItem {
                                op: op.clone(),
                                task: Task::Cancel,
                                done,
                                issued_at,
                            },
                        );
                        tracing::info!("Cancelling queued {:?} of {}", dropped.task, op.id());
                        let _ = dropped.done.send(Err(HistoryError::Cancelled { op: op.id() }));
                        completion
                    }
                    None => self.enqueue(state, op, follow_up),
                }
            }
            OpState::Completed => self.enqueue(state, op, follow_up),
        }
    }

    fn next_job(&self) -> Option<WorkItem> {
        let mut state = self.state.lock();
        let item = state.pending.pop_front()?;

        let token = match item.task {
            Task::Cancel => None,
            _ => Some(item.op.arm_cancellation()),
        };
        state.in_flight = Some(InFlight {
            op: item.op.clone(),
            task: item.task,
            token,
            canceller: None,
        });
        Some(item)
    }

    async fn run_job(&self, item: WorkItem) {
        let WorkItem {
            op,
            task,
            done,
            issued_at,
        } = item;

        // Always awaited to the end; a fired token only asks the handler to stop early
        let result = self.perform(&op, task).await;

        match self.complete(&op, task, issued_at, &result) {
            Outcome::Finished => {
                let _ = done.send(result);
            }
            Outcome::Cancelled(ack) => self.abort(op, task, done, result, ack).await,
        }
    }

    async fn perform(&self, op: &OperationRef, task: Task) -> Result<(), HistoryError> {
        drive(&self.registry, op, task.step()).await?;

        if task == Task::Execute && !op.is_cancelled() {
            if let Some(target) = op.merge_with() {
                self.merge(op, target).await?;
            }
        }
        Ok(())
    }

    async fn merge(&self, source: &OperationRef, target_id: OperationId) -> Result<(), HistoryError> {
        let target = self
            .state
            .lock()
            .history
            .find_last(|candidate| candidate.id() == target_id)
            .cloned();

        let Some(target) = target else {
            tracing::debug!("Merge target {} of {} is gone, skipping merge", target_id, source.id());
            return Ok(());
        };

        if executor::merge(&self.registry, &target, source).await? {
            let removed = self.state.lock().history.remove(source).is_some();
            tracing::debug!("Merged {} into {}", source.id(), target_id);
            if removed {
                self.emit(HistoryEvent::Merged {
                    source: source.id(),
                    target: target_id,
                });
            }
        }
        Ok(())
    }

    /// Settle a finished item unless it was cancelled while running
    fn complete(
        &self,
        op: &OperationRef,
        task: Task,
        issued_at: u64,
        result: &Result<(), HistoryError>,
    ) -> Outcome {
        let mut state = self.state.lock();

        if let Some(flight) = state.in_flight.as_mut() {
            if flight.task != Task::Cancel && flight.token.is_none() {
                return Outcome::Cancelled(flight.canceller.take());
            }
        }
        state.in_flight = None;

        match result {
            Ok(()) => self.emit(match task {
                Task::Execute => HistoryEvent::Executed { op: op.id() },
                Task::Undo => HistoryEvent::Undone { op: op.id() },
                Task::Redo => HistoryEvent::Redone { op: op.id() },
                Task::Cancel => HistoryEvent::Cancelled {
                    op: op.id(),
                    running: None,
                },
            }),
            Err(err) => {
                self.place_after_failure(&mut state, op, task, issued_at, err);
                self.emit(HistoryEvent::Failed {
                    op: op.id(),
                    message: err.to_string(),
                });
            }
        }
        Outcome::Finished
    }

    fn place_after_failure(
        &self,
        state: &mut SchedulerState,
        op: &OperationRef,
        task: Task,
        issued_at: u64,
        err: &HistoryError,
    ) {
        if err.invalidates_history() {
            self.wipe(state, err);
            return;
        }

        // The verb itself succeeded
        if matches!(err, HistoryError::MergeFailed { .. }) {
            return;
        }

        match task {
            Task::Execute => {
                state.history.remove(op);
            }
            Task::Undo => {
                // Still applied, even if newer executes emptied the undo stack
                state.remove_from_undo_stack(op);
                if !state.history.contains(op) {
                    self.restore_history(state, op.clone());
                }
            }
            Task::Redo => {
                state.history.remove(op);
                let superseded = state.sequence != issued_at
                    || state.history.iter().any(|other| other.sequence() > op.sequence());
                if superseded {
                    tracing::debug!("Dropping {} after failed redo, newer operations were executed", op.id());
                } else if !state.undo_stack.contains(op) {
                    state.restore_undo(op.clone());
                }
            }
            Task::Cancel => {}
        }
    }

    /// Run `cancel` for an item cancelled while it ran, then free the slot
    async fn abort(
        &self,
        op: OperationRef,
        task: Task,
        done: Responder,
        result: Result<(), HistoryError>,
        ack: Option<Responder>,
    ) {
        let running = task.running_verb();
        if let Err(err) = &result {
            tracing::debug!("{} settled with an error after cancellation: {}", op.id(), err);
        }
        let cancelled = drive(&self.registry, &op, Step::Cancel(running)).await;

        {
            let mut state = self.state.lock();
            let broken = [&result, &cancelled]
                .into_iter()
                .filter_map(|outcome| outcome.as_ref().err())
                .find(|err| err.invalidates_history());
            if let Some(err) = broken {
                self.wipe(&mut state, err);
            }
            state.in_flight = None;
            self.emit(HistoryEvent::Cancelled { op: op.id(), running });
        }

        let _ = done.send(Err(HistoryError::Cancelled { op: op.id() }));
        if let Some(ack) = ack {
            let _ = ack.send(cancelled);
        }
    }
}

/// Closes the scheduler when the worker stops for any reason
struct CloseOnDrop(Arc<Shared>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.closed = true;
        state.in_flight = None;
        if !state.pending.is_empty() {
            tracing::warn!("History worker stopped with {} queued items", state.pending.len());
        }
        // Dropped responders reject their completions with SchedulerClosed
        state.pending.clear();
        drop(state);
        self.0.idle.notify_waiters();
    }
}

async fn run_worker(shared: Arc<Shared>) {
    let _close = CloseOnDrop(shared.clone());
    tracing::debug!("History worker started");

    loop {
        match shared.next_job() {
            Some(item) => shared.run_job(item).await,
            None => {
                shared.idle.notify_waiters();
                shared.wake.notified().await;
            }
        }
    }
}

/// Undo/redo timeline served by a background worker
///
/// Must be created inside a Tokio runtime. Dropping the scheduler stops the
/// worker; completions still outstanding resolve to `SchedulerClosed`.
pub struct HistoryScheduler {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl HistoryScheduler {
    pub fn new(registry: Arc<BehaviorRegistry>) -> Self {
        Self::with_config(registry, &HistoryConfig::default())
    }

    pub fn with_config(registry: Arc<BehaviorRegistry>, config: &HistoryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let shared = Arc::new(Shared {
            registry,
            state: Mutex::new(SchedulerState {
                history: RingBuffer::new(config.history_capacity),
                undo_stack: Vec::new(),
                pending: VecDeque::new(),
                in_flight: None,
                sequence: 0,
                closed: false,
            }),
            wake: Notify::new(),
            idle: Notify::new(),
            events,
        });

        let worker = tokio::spawn(run_worker(shared.clone()));
        Self { shared, worker }
    }

    /// Record `op` in history and queue its execution
    pub fn execute(&self, op: OperationRef) -> Completion {
        if !self.shared.registry.contains(op.kind(), Verb::Execute) {
            return Completion::ready(Err(HistoryError::NoBehaviorRegistered {
                kind: op.kind().to_string(),
                verb: Verb::Execute,
            }));
        }

        let completion = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Completion::ready(Err(HistoryError::SchedulerClosed));
            }

            if !state.undo_stack.is_empty() {
                tracing::debug!("New operation {} drops {} redo entries", op.id(), state.undo_stack.len());
                state.undo_stack.clear();
            }
            state.sequence += 1;
            op.set_sequence(state.sequence);
            self.shared.push_history(&mut state, op.clone());
            self.shared.enqueue(&mut state, op, Task::Execute)
        };

        self.shared.wake.notify_one();
        completion
    }

    /// Undo the newest operation in history; resolves immediately when there is none
    pub fn undo(&self) -> Completion {
        let completion = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Completion::ready(Err(HistoryError::SchedulerClosed));
            }

            let Some(op) = state.history.pop() else {
                return Completion::ready(Ok(()));
            };
            state.undo_stack.push(op.clone());
            self.shared.retract(&mut state, op, Task::Undo)
        };

        self.shared.wake.notify_one();
        completion
    }

    /// Redo the most recently undone operation; resolves immediately when there is none
    pub fn redo(&self) -> Completion {
        let completion = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Completion::ready(Err(HistoryError::SchedulerClosed));
            }

            let Some(op) = state.undo_stack.pop() else {
                return Completion::ready(Ok(()));
            };
            self.shared.push_history(&mut state, op.clone());
            self.shared.retract(&mut state, op, Task::Redo)
        };

        self.shared.wake.notify_one();
        completion
    }

    /// Cancel everything queued, wait for the in-flight item, then forget all history
    pub async fn clear_history(&self) {
        {
            let mut state = self.shared.state.lock();
            let issued_at = state.sequence;
            for item in state.pending.iter_mut() {
                if item.task == Task::Cancel {
                    continue;
                }
                let (done, _) = Completion::channel();
                let stand_in = WorkItem {
                    op: item.op.clone(),
                    task: Task::Cancel,
                    done,
                    issued_at,
                };
                let dropped = std::mem::replace(item, stand_in);
                let _ = dropped.done.send(Err(HistoryError::Cancelled { op: dropped.op.id() }));
            }
        }

        loop {
            self.settled().await;

            let mut state = self.shared.state.lock();
            if state.is_idle() || state.closed {
                tracing::info!(
                    "Clearing {} history and {} redo entries",
                    state.history.len(),
                    state.undo_stack.len()
                );
                state.history.clear();
                state.undo_stack.clear();
                self.shared.emit(HistoryEvent::Cleared);
                return;
            }
        }
    }

    /// Wait until nothing is queued or in flight
    pub async fn settled(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let done = {
                let state = self.shared.state.lock();
                state.is_idle() || state.closed
            };
            if done {
                return;
            }
            notified.await;
        }
    }

    /// Where `op` is on the timeline; one whose queued item was cancelled reads as `Completed`
    pub fn get_operation_state(&self, op: &Operation) -> OpState {
        self.shared.state.lock().locate(op)
    }

    /// History snapshot, oldest first
    pub fn history(&self) -> Vec<OperationRef> {
        self.shared.state.lock().history.to_vec()
    }

    /// Undo stack snapshot, most recently undone last
    pub fn undo_stack(&self) -> Vec<OperationRef> {
        self.shared.state.lock().undo_stack.clone()
    }

    pub fn can_undo(&self) -> bool {
        !self.shared.state.lock().history.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.shared.state.lock().undo_stack.is_empty()
    }

    pub fn undo_levels(&self) -> usize {
        self.shared.state.lock().history.len()
    }

    pub fn redo_levels(&self) -> usize {
        self.shared.state.lock().undo_stack.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().history.capacity()
    }

    /// Change the history capacity; shrinking forgets the oldest entries
    pub fn resize(&self, capacity: usize) {
        let mut state = self.shared.state.lock();
        for evicted in state.history.scaling(capacity) {
            self.shared.emit(HistoryEvent::Evicted { op: evicted.id() });
        }
        tracing::debug!("History capacity is now {}", state.history.capacity());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.shared.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<BehaviorRegistry> {
        &self.shared.registry
    }
}

impl Drop for HistoryScheduler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl std::fmt::Debug for HistoryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("HistoryScheduler")
            .field("history", &state.history.len())
            .field("undo_stack", &state.undo_stack.len())
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight.as_ref().map(|flight| flight.op.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Behavior;

    fn noop_registry() -> Arc<BehaviorRegistry> {
        let mut registry = BehaviorRegistry::new();
        registry.register("noop", Behavior::execute(|_op| async { Ok(()) }));
        registry.register("noop", Behavior::undo(|_op| async { Ok(()) }));
        registry.register("noop", Behavior::cancel(|_op, _running| async { Ok(()) }));
        registry.register("noop", Behavior::handle_error(|_op, _verb, _err| async { Ok(()) }));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_execute_records_eagerly() {
        let scheduler = HistoryScheduler::new(noop_registry());
        let op = Operation::new("noop").into_ref();

        let completion = scheduler.execute(op.clone());
        assert_eq!(scheduler.history(), vec![op.clone()]);

        completion.await.unwrap();
        assert_eq!(scheduler.get_operation_state(&op), OpState::Completed);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected_up_front() {
        let scheduler = HistoryScheduler::new(noop_registry());
        let completion = scheduler.execute(Operation::new("missing").into_ref());
        assert!(completion.is_ready());
        assert!(matches!(
            completion.await,
            Err(HistoryError::NoBehaviorRegistered { verb: Verb::Execute, .. })
        ));
        assert!(!scheduler.can_undo());
    }

    #[tokio::test]
    async fn test_empty_undo_and_redo_resolve_immediately() {
        let scheduler = HistoryScheduler::new(noop_registry());
        scheduler.undo().await.unwrap();
        scheduler.redo().await.unwrap();
        assert_eq!((scheduler.undo_levels(), scheduler.redo_levels()), (0, 0));
    }

    #[tokio::test]
    async fn test_capacity_and_resize() {
        let config = HistoryConfig {
            history_capacity: 3,
            ..HistoryConfig::default()
        };
        let scheduler = HistoryScheduler::with_config(noop_registry(), &config);
        let mut events = scheduler.subscribe();

        let ops: Vec<OperationRef> = (0..4).map(|_| Operation::new("noop").into_ref()).collect();
        for op in &ops {
            let _ = scheduler.execute(op.clone());
        }
        scheduler.settled().await;

        assert_eq!(scheduler.capacity(), 3);
        assert_eq!(scheduler.history(), ops[1..].to_vec());
        // Eviction happens at call time, before anything runs
        assert_eq!(events.recv().await.unwrap(), HistoryEvent::Evicted { op: ops[0].id() });
        assert_eq!(events.recv().await.unwrap(), HistoryEvent::Executed { op: ops[0].id() });

        scheduler.resize(2);
        assert_eq!(scheduler.history(), ops[2..].to_vec());
    }

    #[tokio::test]
    async fn test_dropping_scheduler_closes_completions() {
        let mut registry = BehaviorRegistry::new();
        registry.register("hang", Behavior::execute(|_op| futures::future::pending()));
        let scheduler = HistoryScheduler::new(Arc::new(registry));

        let first = scheduler.execute(Operation::new("hang").into_ref());
        let second = scheduler.execute(Operation::new("hang").into_ref());
        tokio::task::yield_now().await;
        drop(scheduler);

        assert!(matches!(first.await, Err(HistoryError::SchedulerClosed)));
        assert!(matches!(second.await, Err(HistoryError::SchedulerClosed)));
    }
}
