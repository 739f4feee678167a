//! Timers of a Raft instance
//! A timer is a message the instance schedules to itself. Every kind has a
//! generation counter; re-arming or cancelling a kind bumps it, and a firing
//! whose generation is no longer current is ignored.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Election,
    Heartbeat,
    SnapshotInterval,
    ServerChange,
    LeadershipTransfer,
}

impl TimerKind {
    const COUNT: usize = 5;

    fn slot(self) -> usize {
        match self {
            TimerKind::Election => 0,
            TimerKind::Heartbeat => 1,
            TimerKind::SnapshotInterval => 2,
            TimerKind::ServerChange => 3,
            TimerKind::LeadershipTransfer => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerMessage {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Delivers a timer message back to its instance after a delay.
pub trait Scheduler: Send {
    fn schedule(&mut self, after: Duration, message: TimerMessage);
}

#[derive(Debug, Default)]
pub struct TimerGenerations {
    current: [u64; TimerKind::COUNT],
}

impl TimerGenerations {
    /// Invalidate any armed timer of `kind` and return a fresh message for it.
    pub fn next(&mut self, kind: TimerKind) -> TimerMessage {
        let slot = &mut self.current[kind.slot()];
        *slot += 1;
        TimerMessage {
            kind,
            generation: *slot,
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.current[kind.slot()] += 1;
    }

    pub fn cancel_all(&mut self) {
        for slot in self.current.iter_mut() {
            *slot += 1;
        }
    }

    pub fn is_current(&self, message: &TimerMessage) -> bool {
        self.current[message.kind.slot()] == message.generation
    }
}

/// Scheduler backed by tokio sleeps. Must be used from within a runtime.
pub struct TokioScheduler {
    tx: UnboundedSender<TimerMessage>,
}

impl TokioScheduler {
    pub fn new(tx: UnboundedSender<TimerMessage>) -> Self {
        TokioScheduler { tx }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, after: Duration, message: TimerMessage) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(message);
        });
    }
}
