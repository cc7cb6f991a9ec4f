use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// One unit of work for the dispatcher. Ids are process-global and
/// monotone for log correlation; `cause` is a free-form note about where
/// the event came from.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: u64,
    pub cause: String,
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Event {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            cause: String::new(),
            kind,
        }
    }

    pub fn caused_by(mut self, explanation: impl Into<String>) -> Self {
        self.cause = explanation.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// List repositories available to the installation and (re-)clone them.
    Initialize,
    /// Liveness check, answered in the log.
    Ping,
    /// Drain and exit after the current event.
    Stop,
    /// A comment was posted on a PR.
    PrComment {
        repo: String,
        pr: u64,
        comment_id: u64,
        body: String,
    },
    /// CI finished on a commit.
    CheckCompleted {
        repo: String,
        commit: String,
        good: bool,
    },
}

pub type EventSender = Sender<Event>;
pub type EventReceiver = Receiver<Event>;

/// The event queue: any number of producers (webhook handlers, seeding),
/// exactly one consumer (the dispatcher thread).
pub fn event_channel() -> (EventSender, EventReceiver) {
    unbounded()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_event_ids_are_monotone() {
        let first = Event::new(EventKind::Ping);
        let second = Event::new(EventKind::Ping);
        assert!(second.id > first.id);
    }

    #[test]
    fn test_caused_by() {
        let event = Event::new(EventKind::Ping).caused_by("WEB/webhook PING");
        assert_eq!(event.cause, "WEB/webhook PING");
    }
}
