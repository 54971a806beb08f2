use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::Timestamp;
use crate::emergency::{Availability, EmergencyState};
use crate::incident::Incident;

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum EmergencyEvent {
    StateChanged {
        from: EmergencyState,
        to: EmergencyState,
    },
    IncidentDetected(Incident),
    /// Ask the user "are you okay?"; escalates at `deadline` without an answer.
    ConfirmationRequested {
        deadline: Timestamp,
    },
    SosStarted,
    SosStopped,
    AvailabilityChanged(Availability),
}

// ─── Bus ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of one subscription. Disconnects when the bus closes or
/// the subscription is removed.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: Receiver<EmergencyEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Blocking receive; None once disconnected.
    pub fn recv(&self) -> Option<EmergencyEvent> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<EmergencyEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<EmergencyEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<EmergencyEvent> {
        self.receiver.try_iter().collect()
    }
}

/// Fan-out of emergency events to any number of subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<(SubscriptionId, Sender<EmergencyEvent>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, tx));
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Delivers to every live subscriber; dropped receivers are pruned.
    pub fn publish(&self, event: EmergencyEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Disconnects every subscriber.
    pub fn close(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
