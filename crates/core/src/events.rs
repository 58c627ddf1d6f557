use crate::types::{NodeId, Outcome, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// An event in a run's event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    /// Position in the run's log, starting at 1. Snapshot status events
    /// carry the position of the last logged event they summarise.
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            seq: 0,
            timestamp: Utc::now(),
            event_type,
        }
    }

    /// Completion and error events close the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type,
            EventType::Completed(_) | EventType::Error(_)
        )
    }
}

/// Types of events a run can emit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    Status(StatusEvent),
    Output(OutputEvent),
    ApprovalRequested(ApprovalRequestEvent),
    Completed(CompletionEvent),
    Error(ErrorEvent),
}

/// Cumulative progress of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub progress: u8,
    pub current_step: String,
    pub completed_steps: Vec<String>,
}

/// Output snippet emitted by a node or by the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub source: String,
    pub content: String,
    pub kind: OutputKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Text,
    Info,
    Success,
    Warning,
    Decision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequestEvent {
    pub node_id: NodeId,
    pub question: String,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub outcome: Outcome,
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

struct StreamState {
    log: Vec<Event>,
    status: StatusEvent,
    outputs: Vec<Event>,
    pending_approval: Option<Event>,
    terminal: Option<Event>,
}

impl StreamState {
    fn last_seq(&self) -> u64 {
        self.log.last().map(|e| e.seq).unwrap_or(0)
    }
}

fn lock(state: &Mutex<StreamState>) -> MutexGuard<'_, StreamState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Append-only event log of one run with live fan-out to subscribers.
///
/// Publishing and subscribing both happen under the same lock, so a new
/// subscriber's snapshot and its live feed neither overlap nor leave a gap.
/// A subscriber that falls behind the broadcast buffer replays what it
/// missed from the log.
pub struct EventStream {
    run_id: RunId,
    tx: broadcast::Sender<Event>,
    state: Arc<Mutex<StreamState>>,
}

impl EventStream {
    pub fn new(run_id: RunId, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            run_id,
            tx,
            state: Arc::new(Mutex::new(StreamState {
                log: Vec::new(),
                status: StatusEvent::default(),
                outputs: Vec::new(),
                pending_approval: None,
                terminal: None,
            })),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        lock(&self.state)
    }

    /// Append an event and deliver it to live subscribers.
    ///
    /// Returns `None` once the stream has been closed by a terminal event.
    pub fn publish(&self, event_type: EventType) -> Option<Event> {
        let mut state = self.lock();
        self.publish_locked(&mut state, event_type)
    }

    fn publish_locked(&self, state: &mut StreamState, event_type: EventType) -> Option<Event> {
        if state.terminal.is_some() {
            tracing::debug!(run_id = %self.run_id, "Dropping event published after stream closed");
            return None;
        }

        let mut event = Event::new(self.run_id, event_type);
        event.seq = state.last_seq() + 1;
        match &event.event_type {
            EventType::Status(status) => state.status = status.clone(),
            EventType::Output(_) => state.outputs.push(event.clone()),
            EventType::ApprovalRequested(_) => state.pending_approval = Some(event.clone()),
            EventType::Completed(_) | EventType::Error(_) => {
                state.pending_approval = None;
                state.terminal = Some(event.clone());
            }
        }
        state.log.push(event.clone());

        // No receivers is fine
        let _ = self.tx.send(event.clone());
        Some(event)
    }

    /// Apply a change to the cumulative status and publish the result
    pub fn update_status(&self, update: impl FnOnce(&mut StatusEvent)) -> Option<Event> {
        let mut state = self.lock();
        let mut status = state.status.clone();
        update(&mut status);
        self.publish_locked(&mut state, EventType::Status(status))
    }

    pub fn output(&self, source: impl Into<String>, content: impl Into<String>, kind: OutputKind) {
        self.publish(EventType::Output(OutputEvent {
            source: source.into(),
            content: content.into(),
            kind,
        }));
    }

    /// Mark the pending approval request as answered
    pub(crate) fn clear_pending_approval(&self) {
        self.lock().pending_approval = None;
    }

    pub fn status(&self) -> StatusEvent {
        self.lock().status.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().terminal.is_some()
    }

    /// Full event log so far
    pub fn history(&self) -> Vec<Event> {
        self.lock().log.clone()
    }

    /// Subscribe to the stream.
    ///
    /// The subscription first yields a snapshot: the current status, every
    /// output so far, the open approval request if any, and the terminal
    /// event if the run already finished. Live events follow.
    pub fn subscribe(&self) -> Subscription {
        let state = self.lock();

        let delivered = state.last_seq();
        let mut snapshot = Event::new(self.run_id, EventType::Status(state.status.clone()));
        snapshot.seq = delivered;

        let mut backlog = VecDeque::new();
        backlog.push_back(snapshot);
        backlog.extend(state.outputs.iter().cloned());
        if let Some(pending) = &state.pending_approval {
            backlog.push_back(pending.clone());
        }

        let receiver = match &state.terminal {
            Some(terminal) => {
                backlog.push_back(terminal.clone());
                None
            }
            None => Some(self.tx.subscribe()),
        };

        Subscription {
            backlog,
            receiver,
            delivered,
            state: Arc::clone(&self.state),
        }
    }
}

/// A subscriber's view of one run's event stream
pub struct Subscription {
    backlog: VecDeque<Event>,
    receiver: Option<broadcast::Receiver<Event>>,
    /// Highest log position already delivered or queued in the backlog
    delivered: u64,
    state: Arc<Mutex<StreamState>>,
}

impl Subscription {
    /// Next event, or `None` after the terminal event has been delivered
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.is_terminal() {
                    self.receiver = None;
                }
                return Some(event);
            }

            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) => {
                    // Already replayed from the log
                    if event.seq <= self.delivered {
                        continue;
                    }
                    self.delivered = event.seq;
                    if event.is_terminal() {
                        self.receiver = None;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Event subscriber lagged by {} events, replaying from seq {}",
                        skipped,
                        self.delivered + 1
                    );
                    self.replay_missed();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    fn replay_missed(&mut self) {
        let state = lock(&self.state);
        let delivered = self.delivered;
        for event in state.log.iter().filter(|e| e.seq > delivered) {
            self.delivered = event.seq;
            self.backlog.push_back(event.clone());
        }
    }

    /// Drain the subscription until the stream closes
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}
