//! Instance ladder and core states
//!
//! An instance climbs a ladder of paired states. Every pair is an action half
//! (`Open`, the command has been issued) followed by a done half (`OpenDone`,
//! the hardware acknowledged it):
//!
//! ```text
//!   bring-up                                   tear-down
//!   UninitDone -> CoreInit(Done) -> Open(Done) -> LoadResources(Done) -> Start(Done)
//!                                                                          |
//!   CloseDone <- Close <- ReleaseResources(Done) <- Stop(Done) <-----------+
//! ```
//!
//! Bring-up and tear-down are two explicit step tables. A request that crosses
//! from one half to the other is first reflected through the `Stop` pivot onto
//! the equivalent rung of the other half, then walked forward in that table.
//! Ladder order is defined by [`LADDER`], never by enum discriminants.

use serde::{Deserialize, Serialize};

/// Session lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Uninit,
    UninitDone,
    CoreInit,
    CoreInitDone,
    Open,
    OpenDone,
    LoadResources,
    LoadResourcesDone,
    Start,
    StartDone,
    Stop,
    StopDone,
    ReleaseResources,
    ReleaseResourcesDone,
    Close,
    CloseDone,
    /// Reachable from anywhere, sticky until forced cleanup
    Invalid,
}

/// Canonical ascending ladder. `Invalid` is deliberately absent.
pub const LADDER: [InstanceState; 16] = [
    InstanceState::Uninit,
    InstanceState::UninitDone,
    InstanceState::CoreInit,
    InstanceState::CoreInitDone,
    InstanceState::Open,
    InstanceState::OpenDone,
    InstanceState::LoadResources,
    InstanceState::LoadResourcesDone,
    InstanceState::Start,
    InstanceState::StartDone,
    InstanceState::Stop,
    InstanceState::StopDone,
    InstanceState::ReleaseResources,
    InstanceState::ReleaseResourcesDone,
    InstanceState::Close,
    InstanceState::CloseDone,
];

/// Which half of the ladder a state belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Everything below the `Stop` pivot
    BringUp,
    /// `Stop` and above
    TearDown,
}

impl InstanceState {
    /// Position on the ladder, `None` for `Invalid`
    pub fn rung(self) -> Option<usize> {
        LADDER.iter().position(|s| *s == self)
    }

    /// Half of the ladder this state lives in
    pub fn direction(self) -> Option<Direction> {
        let pivot = InstanceState::Stop.rung()?;
        self.rung().map(|r| {
            if r < pivot {
                Direction::BringUp
            } else {
                Direction::TearDown
            }
        })
    }

    /// Whether this is the action half of a pair (command issued, not yet acknowledged)
    pub fn is_pending(self) -> bool {
        BRING_UP
            .iter()
            .chain(TEAR_DOWN.iter())
            .any(|step| step.action == self)
    }

    /// True when `self` is on the ladder at or above `other`
    pub fn at_or_past(self, other: InstanceState) -> bool {
        match (self.rung(), other.rung()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }

    /// True when `self` is on the ladder strictly below `other`
    pub fn before(self, other: InstanceState) -> bool {
        match (self.rung(), other.rung()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    /// Session handle is valid in `[OpenDone, Close)`
    pub fn has_session(self) -> bool {
        self.at_or_past(InstanceState::OpenDone) && self.before(InstanceState::Close)
    }

    /// Instance contributes to load in `[OpenDone, StopDone)`
    pub fn is_loaded(self) -> bool {
        self.at_or_past(InstanceState::OpenDone) && self.before(InstanceState::StopDone)
    }

    /// `Uninit` has nothing done yet, the same position as `UninitDone`
    fn settled(self) -> InstanceState {
        match self {
            InstanceState::Uninit => InstanceState::UninitDone,
            other => other,
        }
    }
}

/// Hardware work behind one ladder pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOp {
    CoreInit,
    SessionInit,
    LoadResources,
    Start,
    Stop,
    ReleaseResources,
    Close,
}

/// One paired step of the ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Done state the step starts from
    pub from: InstanceState,
    /// Action half entered once the command is issued
    pub action: InstanceState,
    /// Done half entered once the hardware acknowledges
    pub done: InstanceState,
    /// Work performed
    pub op: StepOp,
}

const fn step(from: InstanceState, action: InstanceState, done: InstanceState, op: StepOp) -> Step {
    Step {
        from,
        action,
        done,
        op,
    }
}

/// Bring-up steps, ascending
pub const BRING_UP: [Step; 4] = [
    step(
        InstanceState::UninitDone,
        InstanceState::CoreInit,
        InstanceState::CoreInitDone,
        StepOp::CoreInit,
    ),
    step(
        InstanceState::CoreInitDone,
        InstanceState::Open,
        InstanceState::OpenDone,
        StepOp::SessionInit,
    ),
    step(
        InstanceState::OpenDone,
        InstanceState::LoadResources,
        InstanceState::LoadResourcesDone,
        StepOp::LoadResources,
    ),
    step(
        InstanceState::LoadResourcesDone,
        InstanceState::Start,
        InstanceState::StartDone,
        StepOp::Start,
    ),
];

/// Tear-down steps, ascending
pub const TEAR_DOWN: [Step; 3] = [
    step(
        InstanceState::StartDone,
        InstanceState::Stop,
        InstanceState::StopDone,
        StepOp::Stop,
    ),
    step(
        InstanceState::StopDone,
        InstanceState::ReleaseResources,
        InstanceState::ReleaseResourcesDone,
        StepOp::ReleaseResources,
    ),
    step(
        InstanceState::ReleaseResourcesDone,
        InstanceState::Close,
        InstanceState::CloseDone,
        StepOp::Close,
    ),
];

/// Bring-up done states and the tear-down rung that undoes exactly the same work
const MIRROR_DOWN: [(InstanceState, InstanceState); 4] = [
    (InstanceState::UninitDone, InstanceState::CloseDone),
    (InstanceState::CoreInitDone, InstanceState::CloseDone),
    (InstanceState::OpenDone, InstanceState::ReleaseResourcesDone),
    (InstanceState::LoadResourcesDone, InstanceState::StopDone),
];

/// Tear-down done states and the bring-up rung holding the same resources
const MIRROR_UP: [(InstanceState, InstanceState); 3] = [
    (InstanceState::StopDone, InstanceState::LoadResourcesDone),
    (InstanceState::ReleaseResourcesDone, InstanceState::OpenDone),
    (InstanceState::CloseDone, InstanceState::CoreInitDone),
];

/// Reflect a done state onto the half of the ladder `target` lives in
///
/// States already in the target's half, and pending action states, come back
/// unchanged.
pub fn reflect(current: InstanceState, target: InstanceState) -> InstanceState {
    let current = current.settled();
    let table: &[(InstanceState, InstanceState)] = match (current.direction(), target.direction()) {
        (Some(Direction::BringUp), Some(Direction::TearDown)) => &MIRROR_DOWN,
        (Some(Direction::TearDown), Some(Direction::BringUp)) => &MIRROR_UP,
        _ => return current,
    };
    table
        .iter()
        .find(|(from, _)| *from == current)
        .map(|(_, to)| *to)
        .unwrap_or(current)
}

/// Step that starts at `position` in the table for `target`'s half
pub fn next_step(position: InstanceState, target: InstanceState) -> Option<Step> {
    let table: &[Step] = match target.direction()? {
        Direction::BringUp => &BRING_UP,
        Direction::TearDown => &TEAR_DOWN,
    };
    table.iter().copied().find(|s| s.from == position.settled())
}

/// Step whose action half is `pending`
pub fn pending_step(pending: InstanceState) -> Option<Step> {
    BRING_UP
        .iter()
        .chain(TEAR_DOWN.iter())
        .copied()
        .find(|s| s.action == pending)
}

/// What the ladder walker should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Target already satisfied
    Done,
    /// Issue the step's command, then await its acknowledgement
    Issue(Step),
    /// Command already issued; only the acknowledgement is outstanding
    Await(Step),
}

/// Decide the next move from `current` towards `target`
///
/// Returns `None` when no step leads towards the target (including `Invalid`).
pub fn plan(current: InstanceState, target: InstanceState) -> Option<Plan> {
    if current == InstanceState::Invalid || target == InstanceState::Invalid {
        return None;
    }
    let current = current.settled();

    if current.is_pending() {
        let step = pending_step(current)?;
        if current.direction() == target.direction() && current.at_or_past(target) {
            return Some(Plan::Done);
        }
        return Some(Plan::Await(step));
    }

    let position = reflect(current, target);
    if position.at_or_past(target) {
        return Some(Plan::Done);
    }
    next_step(position, target).map(Plan::Issue)
}

/// Core (engine-wide) state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoreState {
    Uninit,
    /// Core-init issued, acknowledgement outstanding
    Init,
    InitDone,
    /// Fatal error; sticky until the last instance leaves
    Invalid,
}

impl CoreState {
    /// Whether the core has at least issued core-init and is not failed
    pub fn is_initialized(self) -> bool {
        matches!(self, CoreState::Init | CoreState::InitDone)
    }
}
