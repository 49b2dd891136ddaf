// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// No deadline armed; waiters park until the gate changes.
    Never,
    /// Fire at the given instant. An instant already in the past fires
    /// immediately.
    At(Instant),
    /// Fired and latched; waiters return at once until the next `set`.
    Expired,
}

/// A cancellable, resettable wall-clock gate.
///
/// Stream reads and writes wait on one of these to enforce caller-supplied
/// deadlines independent of I/O progress. Re-arming with `set` invalidates
/// every pending waiter: each one observes the change and starts waiting
/// on the new instant.
#[derive(Debug)]
pub struct Deadline {
    gate: watch::Sender<Gate>,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

impl Deadline {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(Gate::Never);
        Self { gate }
    }

    /// Arm the gate at `t`, or disarm it with `None`. Replaces any
    /// previous arming, including a latched `cancel`.
    pub fn set(&self, t: Option<Instant>) {
        let next = match t {
            Some(t) => Gate::At(t),
            None => Gate::Never,
        };
        self.gate.send_replace(next);
    }

    /// Fire immediately and latch until the next `set`.
    pub fn cancel(&self) {
        self.gate.send_replace(Gate::Expired);
    }

    /// Resolves when the gate fires. Cancel-safe: dropping the future and
    /// waiting again observes the current arming.
    pub async fn expired(&self) {
        let mut rx = self.gate.subscribe();
        loop {
            let gate = *rx.borrow_and_update();
            match gate {
                Gate::Expired => return,
                Gate::Never => {
                    // Sender lives in self, so `changed` cannot fail while
                    // we hold the borrow.
                    let _ = rx.changed().await;
                },
                Gate::At(t) => {
                    tokio::select! {
                        _ = sleep_until(t) => return,
                        _ = rx.changed() => {},
                    }
                },
            }
        }
    }
}
