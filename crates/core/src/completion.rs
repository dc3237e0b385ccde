//! One-shot completions correlating commands with their responses
//!
//! Every instance (and the core) owns a [`CompletionRegistry`] with one slot per
//! [`ResponseKind`]. A slot is armed right before the command that can trigger
//! it is sent, signalled at most once per arm by the dispatcher, and consumed by
//! the single waiter holding the owner's transition lock.
//!
//! A wait that times out leaves the slot armed, so a late response is kept for
//! the next wait instead of being lost.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::hfi::{Response, ResponseKind, STATUS_OK};
use crate::{Error, Result};

/// What a waiter is woken with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The hardware answered
    Response(Response),
    /// The owner was invalidated; no answer will come
    Aborted,
}

#[derive(Debug)]
enum SlotState {
    Idle,
    Armed,
    Signaled(Signal),
}

#[derive(Debug)]
struct CompletionSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl CompletionSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
            notify: Notify::new(),
        }
    }
}

/// Per-owner array of completion slots indexed by response kind
#[derive(Debug)]
pub struct CompletionRegistry {
    owner: String,
    slots: Vec<CompletionSlot>,
}

impl CompletionRegistry {
    /// Create a registry; `owner` only appears in logs
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            slots: (0..ResponseKind::COUNT).map(|_| CompletionSlot::new()).collect(),
        }
    }

    fn slot(&self, kind: ResponseKind) -> &CompletionSlot {
        &self.slots[kind.index()]
    }

    /// Re-arm a slot, discarding anything it held
    ///
    /// Must be called before the command that triggers `kind` is sent.
    pub fn arm(&self, kind: ResponseKind) {
        let mut state = self.slot(kind).state.lock();
        if let SlotState::Signaled(stale) = &*state {
            tracing::debug!("{}: discarding unconsumed {:?} ({:?})", self.owner, kind, stale);
        }
        *state = SlotState::Armed;
    }

    /// Whether a command is outstanding for `kind`
    pub fn is_armed(&self, kind: ResponseKind) -> bool {
        matches!(*self.slot(kind).state.lock(), SlotState::Armed)
    }

    /// Complete an armed slot
    ///
    /// Returns `false` (and drops the signal) when the slot is not armed, which
    /// keeps every arm signalled at most once.
    pub fn signal(&self, kind: ResponseKind, signal: Signal) -> bool {
        let slot = self.slot(kind);
        {
            let mut state = slot.state.lock();
            match &*state {
                SlotState::Armed => *state = SlotState::Signaled(signal),
                _ => {
                    tracing::warn!("{}: unsolicited {:?}, dropping", self.owner, kind);
                    return false;
                }
            }
        }
        slot.notify.notify_one();
        true
    }

    /// Wake every armed slot with [`Signal::Aborted`]
    ///
    /// Used on fatal escalation and forced cleanup so nobody waits on hardware
    /// that will never answer. Returns the number of slots woken.
    pub fn abort_all(&self) -> usize {
        let mut woken = 0;
        for slot in &self.slots {
            let mut state = slot.state.lock();
            if matches!(*state, SlotState::Armed) {
                *state = SlotState::Signaled(Signal::Aborted);
                drop(state);
                slot.notify.notify_one();
                woken += 1;
            }
        }
        woken
    }

    /// Wake one armed slot with [`Signal::Aborted`]
    pub fn abort(&self, kind: ResponseKind) -> bool {
        let slot = self.slot(kind);
        let mut state = slot.state.lock();
        if !matches!(*state, SlotState::Armed) {
            return false;
        }
        *state = SlotState::Signaled(Signal::Aborted);
        drop(state);
        slot.notify.notify_one();
        true
    }

    /// Wait for `kind` to be signalled, bounded by `timeout`
    ///
    /// On timeout the slot stays armed and nothing else changes.
    pub async fn wait(&self, kind: ResponseKind, timeout: Duration) -> Result<Response> {
        let slot = self.slot(kind);
        let signalled = async {
            loop {
                let notified = slot.notify.notified();
                {
                    let mut state = slot.state.lock();
                    if matches!(*state, SlotState::Signaled(_)) {
                        if let SlotState::Signaled(signal) =
                            std::mem::replace(&mut *state, SlotState::Idle)
                        {
                            return signal;
                        }
                    }
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, signalled).await {
            Ok(Signal::Response(response)) => Ok(response),
            Ok(Signal::Aborted) => Err(Error::SessionInvalidated { kind }),
            Err(_) => {
                tracing::warn!("{}: no {:?} within {:?}", self.owner, kind, timeout);
                Err(Error::timeout(kind, timeout))
            }
        }
    }
}

/// Fail on a done-message carrying a non-OK status
pub(crate) fn check_status(response: &Response) -> Result<()> {
    let status = match response {
        Response::SysInitDone { status } | Response::SysReleaseResourceDone { status } => {
            Some(*status)
        }
        Response::Session { message, .. } => message.status(),
        _ => None,
    };
    match status {
        Some(status) if status != STATUS_OK => Err(Error::HardwareStatus {
            kind: response.kind(),
            status,
        }),
        _ => Ok(()),
    }
}
