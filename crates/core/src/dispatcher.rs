//! Response dispatcher
//!
//! Runs as its own task, draining the response channel. Each response kind
//! maps to one handler in [`HANDLERS`]. Handlers only take short locks, signal
//! completions, update state and emit events. Nothing here awaits the
//! hardware: re-votes triggered by a response run as a separate task.

use std::sync::{Arc, Weak};

use futures::future::{self, BoxFuture, FutureExt};

use crate::completion::Signal;
use crate::engine::Core;
use crate::hfi::{Port, Response, ResponseKind, ResponseReceiver, SessionMessage};
use crate::instance::{Instance, InstanceEvent};

type Handler = for<'a> fn(&'a Core, Response) -> BoxFuture<'a, ()>;

/// Handler per response kind, in [`ResponseKind`] index order
const HANDLERS: [(ResponseKind, Handler); ResponseKind::COUNT] = [
    (ResponseKind::SysInitDone, complete_core),
    (ResponseKind::SysReleaseResourceDone, complete_core),
    (ResponseKind::SysError, sys_error),
    (ResponseKind::WatchdogTimeout, sys_error),
    (ResponseKind::SessionInitDone, complete_session),
    (ResponseKind::PropertyInfo, complete_session),
    (ResponseKind::LoadResourceDone, complete_session),
    (ResponseKind::StartDone, complete_session),
    (ResponseKind::InputBufferDone, input_done),
    (ResponseKind::OutputBufferDone, output_done),
    (ResponseKind::StopDone, complete_session),
    (ResponseKind::ReleaseResourceDone, complete_session),
    (ResponseKind::EndDone, complete_session),
    (ResponseKind::EventChange, event_change),
    (ResponseKind::FlushDone, flush_done),
    (ResponseKind::SeqHeaderDone, seq_header_done),
    (ResponseKind::SessionError, session_error),
    (ResponseKind::ReleaseBufferDone, complete_session),
];

/// Drain responses until the hardware side or the core goes away
pub(crate) async fn run(core: Weak<Core>, mut responses: ResponseReceiver) {
    while let Some(response) = responses.rx.recv().await {
        let Some(core) = core.upgrade() else {
            break;
        };
        dispatch(&core, response).await;
    }
    tracing::debug!("Response dispatcher stopped");
}

async fn dispatch(core: &Core, response: Response) {
    let kind = response.kind();
    let (expected, handler) = HANDLERS[kind.index()];
    debug_assert_eq!(expected, kind);
    tracing::trace!("Dispatching {:?}", kind);
    handler(core, response).await;
}

/// Instance a session response is addressed to
fn target(core: &Core, response: &Response) -> Option<Arc<Instance>> {
    let Response::Session { session, .. } = response else {
        return None;
    };
    let instance = core.instance_by_session(*session);
    if instance.is_none() {
        tracing::warn!("{:?} for unknown session {:?}, dropping", response.kind(), session);
    }
    instance
}

fn complete_core(core: &Core, response: Response) -> BoxFuture<'_, ()> {
    core.completions()
        .signal(response.kind(), Signal::Response(response));
    future::ready(()).boxed()
}

fn complete_session(core: &Core, response: Response) -> BoxFuture<'_, ()> {
    if let Some(instance) = target(core, &response) {
        instance
            .completions()
            .signal(response.kind(), Signal::Response(response));
    }
    future::ready(()).boxed()
}

fn sys_error(core: &Core, response: Response) -> BoxFuture<'_, ()> {
    let code = match response {
        Response::SysError { code } => Some(code),
        _ => None,
    };
    core.escalate_fatal(code);
    future::ready(()).boxed()
}

fn input_done(core: &Core, response: Response) -> BoxFuture<'_, ()> {
    if let Some(instance) = target(core, &response) {
        if let Response::Session {
            message: SessionMessage::InputBufferDone(done),
            ..
        } = response
        {
            instance.on_buffer_done(Port::Input, done);
        }
    }
    future::ready(()).boxed()
}

fn output_done(core: &Core, response: Response) -> BoxFuture<'_, ()> {
    if let Some(instance) = target(core, &response) {
        if let Response::Session {
            message: SessionMessage::OutputBufferDone(done),
            ..
        } = response
        {
            instance.on_buffer_done(Port::Output, done);

            // the vote is an aggregate, so any fps change re-votes for everyone
            let fps_changed = done.filled_len > 0
                && instance.observe_output_timestamp(
                    done.timestamp_us,
                    core.config().fps_deviation_threshold,
                );
            if fps_changed && instance.state().is_loaded() {
                core.schedule_rescale();
            }
        }
    }
    future::ready(()).boxed()
}

fn seq_header_done(core: &Core, response: Response) -> BoxFuture<'_, ()> {
    if let Some(instance) = target(core, &response) {
        if let Response::Session {
            message: SessionMessage::SeqHeaderDone(done),
            ..
        } = response
        {
            instance.on_sequence_header(done);
        }
    }
    future::ready(()).boxed()
}

fn event_change(core: &Core, response: Response) -> BoxFuture<'_, ()> {
    if let Some(instance) = target(core, &response) {
        if let Response::Session {
            message: SessionMessage::EventChange(change),
            ..
        } = response
        {
            instance.on_port_change(change);
        }
    }
    future::ready(()).boxed()
}

fn flush_done(core: &Core, response: Response) -> BoxFuture<'_, ()> {
    if let Some(instance) = target(core, &response) {
        if let Response::Session {
            message: SessionMessage::FlushDone { scope },
            ..
        } = response
        {
            instance.on_flush_done(scope);
        }
    }
    future::ready(()).boxed()
}

fn session_error(core: &Core, response: Response) -> BoxFuture<'_, ()> {
    if let Some(instance) = target(core, &response) {
        if let Response::Session {
            message: SessionMessage::Error { code },
            ..
        } = response
        {
            if instance.invalidate(InstanceEvent::SessionError { code }) {
                // its load no longer counts
                core.schedule_rescale();
            }
        }
    }
    future::ready(()).boxed()
}
