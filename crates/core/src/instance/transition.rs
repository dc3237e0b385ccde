//! Ladder walker
//!
//! [`Instance::try_state`] asks [`plan`] for the next move and executes it
//! until the target is reached or a step fails. Each step is split in two:
//! `issue` arms the completion, sends the command and enters the action half;
//! `complete` waits for the acknowledgement and enters the done half.
//!
//! Failure leaves the state as follows:
//! - command rejected: the step's starting state, nothing was entered
//! - failure status in the acknowledgement: the step's starting state
//! - timeout: the action half, so the next call re-awaits the same slot

use std::sync::atomic::Ordering;

use crate::completion::check_status;
use crate::engine::Core;
use crate::hfi::{BufferKind, ResponseKind};
use crate::state::{plan, CoreState, InstanceState, Plan, Step, StepOp};
use crate::{Error, Result};

use super::Instance;

impl StepOp {
    /// Response acknowledging the step, `None` when the core awaits it
    fn ack(self) -> Option<ResponseKind> {
        match self {
            StepOp::CoreInit => None,
            StepOp::SessionInit => Some(ResponseKind::SessionInitDone),
            StepOp::LoadResources => Some(ResponseKind::LoadResourceDone),
            StepOp::Start => Some(ResponseKind::StartDone),
            StepOp::Stop => Some(ResponseKind::StopDone),
            StepOp::ReleaseResources => Some(ResponseKind::ReleaseResourceDone),
            StepOp::Close => Some(ResponseKind::EndDone),
        }
    }
}

impl Instance {
    /// Drive the session towards `target`
    ///
    /// Walks one paired step at a time and stops at the first error. A target
    /// the instance is already at or past is a no-op.
    pub async fn try_state(&self, target: InstanceState) -> Result<()> {
        if target == InstanceState::Invalid {
            return Err(Error::InvalidArgument(
                "Invalid is not a transition target".to_string(),
            ));
        }

        self.ensure_attached("try_state")?;
        let _guard = self.transition.lock().await;
        let core = self.core()?;
        tracing::debug!("instance {}: try_state {:?} -> {:?}", self.id, self.state(), target);

        loop {
            // forced cleanup may have run while we waited
            self.ensure_attached("try_state")?;
            let current = self.state();
            let next = plan(current, target).ok_or(Error::InvalidState {
                operation: "try_state",
                state: current,
            })?;
            match next {
                Plan::Done => return Ok(()),
                Plan::Issue(step) => {
                    self.issue(&core, step).await?;
                    self.complete(&core, step).await?;
                }
                Plan::Await(step) => self.complete(&core, step).await?,
            }
        }
    }

    async fn issue(&self, core: &Core, step: Step) -> Result<()> {
        tracing::debug!("instance {}: issuing {:?}", self.id, step.op);
        let hw = core.hw();
        if let Some(kind) = step.op.ack() {
            self.completions.arm(kind);
        }

        match step.op {
            StepOp::CoreInit => {}
            StepOp::SessionInit => {
                hw.init_session(self.handle, self.session_type, self.codec)
                    .await?;
                self.session_open.store(true, Ordering::Release);
            }
            StepOp::LoadResources => {
                core.admit(self)?;
                if core.config().on_chip_memory {
                    core.ensure_on_chip_memory().await?;
                }
                hw.load_resources(self.handle).await?;
            }
            StepOp::Start => hw.start_session(self.handle).await?,
            StepOp::Stop => hw.stop_session(self.handle).await?,
            StepOp::ReleaseResources => hw.release_resources(self.handle).await?,
            StepOp::Close => {
                self.release_internal_locked(BufferKind::Scratch).await?;
                self.release_internal_locked(BufferKind::Persist).await?;
                hw.end_session(self.handle).await?;
            }
        }

        self.advance("try_state", step.action)
    }

    async fn complete(&self, core: &Core, step: Step) -> Result<()> {
        let result = match step.op.ack() {
            None => self.await_core_init().await,
            Some(kind) => self
                .wait_ack(kind, core.config().hw_response_timeout())
                .await
                .and_then(|response| check_status(&response)),
        };

        if let Err(e) = result {
            // a timeout keeps the action half so the next call re-awaits
            if !matches!(e, Error::Timeout { .. }) {
                let mut state = self.state.write();
                if *state == step.action {
                    *state = step.from;
                }
            }
            tracing::warn!("instance {}: {:?} failed: {}", self.id, step.op, e);
            return Err(e);
        }

        match step.op {
            StepOp::SessionInit => {
                let mut lists = self.buffers.lock();
                lists.seq_header_requested = false;
            }
            StepOp::Close => self.session_open.store(false, Ordering::Release),
            _ => {}
        }

        if step.op == StepOp::Start {
            self.drain_pending_and_start(core).await?;
        } else {
            self.advance("try_state", step.done)?;
        }

        tracing::debug!("instance {}: {:?} done", self.id, step.op);
        if step.op != StepOp::CoreInit {
            core.rescale().await;
        }
        Ok(())
    }

    /// Core init runs in its own task; a detached instance stops waiting and
    /// the core finishes or unwinds on its own
    async fn await_core_init(&self) -> Result<()> {
        let core = self.core()?;
        let init = tokio::spawn(async move { core.init().await });
        tokio::select! {
            joined = init => joined.unwrap_or_else(|e| {
                Err(Error::CoreUnavailable {
                    state: CoreState::Uninit,
                    context: format!("core init task failed: {}", e),
                })
            }),
            _ = self.detached() => Err(Error::SessionInvalidated {
                kind: ResponseKind::SysInitDone,
            }),
        }
    }
}
