//! One encode or decode session bound to a [`Core`]
//!
//! An [`Instance`] is created by [`Core::open_instance`] and climbs the ladder
//! in [`crate::state`] through [`Instance::try_state`]. Caller buffers, flushes
//! and internal working memory are handled in `buffers`; the ladder walker
//! lives in `transition`.
//!
//! Locking: the transition lock (`tokio::sync::Mutex`) serializes every
//! operation that waits on hardware. Everything else sits behind short
//! `parking_lot` locks that are never held across an await, so the dispatcher
//! can always make progress.

mod buffers;
mod transition;

pub use buffers::VideoBuffer;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

use crate::completion::CompletionRegistry;
use crate::engine::Core;
use crate::hfi::{
    BufferDone, BufferKind, BufferRequirement, Codec, FlushScope, FrameFlags, InternalBufferInfo,
    Port, PortChange, Response, ResponseKind, SessionHandle, SessionType,
};
use crate::scaler::{fps_from_interval, macroblock_load};
use crate::state::{CoreState, InstanceState};
use crate::{Error, Result};

/// Parameters fixed when a session is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub session_type: SessionType,
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    /// Frames per second; the core's default when unset
    pub fps: Option<u32>,
}

impl SessionConfig {
    /// Decoder session for `codec` at the given resolution
    pub fn decoder(codec: Codec, width: u32, height: u32) -> Self {
        Self {
            session_type: SessionType::Decoder,
            codec,
            width,
            height,
            fps: None,
        }
    }

    /// Encoder session for `codec` at the given resolution
    pub fn encoder(codec: Codec, width: u32, height: u32) -> Self {
        Self {
            session_type: SessionType::Encoder,
            codec,
            width,
            height,
            fps: None,
        }
    }

    /// Set the frame rate
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = Some(fps);
        self
    }
}

/// Notifications delivered to the owner of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    /// Engine finished with an input buffer
    InputDone(VideoBuffer),
    /// Engine produced an output buffer; a sequence header carries `CODEC_CONFIG`
    OutputDone(VideoBuffer),
    /// Buffer handed back without being processed (flush or teardown)
    BufferReturned { port: Port, buffer: VideoBuffer },
    FlushDone { scope: FlushScope },
    /// Stream resolution changed; output port must be reconfigured
    PortSettingsChanged(PortChange),
    /// Engine reported an error for this session; instance is now invalid
    SessionError { code: u32 },
    /// Engine failed as a whole; every instance is now invalid
    SysError { code: Option<u32> },
}

/// Frame counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InstanceStats {
    pub inputs_submitted: u64,
    pub outputs_submitted: u64,
    pub inputs_done: u64,
    pub outputs_done: u64,
    /// Caller buffers waiting for the session to start
    pub pending: usize,
}

#[derive(Debug, Clone, Copy)]
struct Properties {
    width: u32,
    height: u32,
    fps: u32,
    prev_output_ts: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
struct PendingBuffer {
    port: Port,
    buffer: VideoBuffer,
}

#[derive(Debug, Default)]
struct BufferLists {
    scratch: Vec<InternalBufferInfo>,
    persist: Vec<InternalBufferInfo>,
    pending: VecDeque<PendingBuffer>,
    /// Forwarded to the engine, not yet returned
    outstanding: HashMap<(Port, u64), VideoBuffer>,
    /// Encoder's first output has been spent on the sequence header
    seq_header_requested: bool,
}

impl BufferLists {
    fn internal_mut(&mut self, kind: BufferKind) -> Option<&mut Vec<InternalBufferInfo>> {
        match kind {
            BufferKind::Scratch => Some(&mut self.scratch),
            BufferKind::Persist => Some(&mut self.persist),
            BufferKind::Input | BufferKind::Output => None,
        }
    }
}

/// An encode or decode session
#[derive(Debug)]
pub struct Instance {
    id: u64,
    core: Weak<Core>,
    session_type: SessionType,
    codec: Codec,
    handle: SessionHandle,
    state: RwLock<InstanceState>,
    props: Mutex<Properties>,
    completions: CompletionRegistry,
    transition: tokio::sync::Mutex<()>,
    buffers: Mutex<BufferLists>,
    requirements: Mutex<Vec<BufferRequirement>>,
    stats: Mutex<InstanceStats>,
    in_reconfig: AtomicBool,
    /// init_session went out and end_session has not been acknowledged
    session_open: AtomicBool,
    /// Closed or force-cleaned; no longer part of its core
    detached: AtomicBool,
    /// Wakes a walker blocked on hardware when the instance is detached
    abort: Notify,
    events: mpsc::UnboundedSender<InstanceEvent>,
}

impl Instance {
    pub(crate) fn new(
        id: u64,
        core: Weak<Core>,
        config: &SessionConfig,
        fps: u32,
        events: mpsc::UnboundedSender<InstanceEvent>,
    ) -> Self {
        Self {
            id,
            core,
            session_type: config.session_type,
            codec: config.codec,
            handle: SessionHandle(id),
            state: RwLock::new(InstanceState::Uninit),
            props: Mutex::new(Properties {
                width: config.width,
                height: config.height,
                fps,
                prev_output_ts: None,
            }),
            completions: CompletionRegistry::new(format!("instance {}", id)),
            transition: tokio::sync::Mutex::new(()),
            buffers: Mutex::new(BufferLists::default()),
            requirements: Mutex::new(Vec::new()),
            stats: Mutex::new(InstanceStats::default()),
            in_reconfig: AtomicBool::new(false),
            session_open: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            abort: Notify::new(),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Current ladder state
    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    /// Hardware session handle, only present while the session exists
    pub fn session(&self) -> Option<SessionHandle> {
        self.state().has_session().then_some(self.handle)
    }

    pub(crate) fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Current `(width, height)`
    pub fn dimensions(&self) -> (u32, u32) {
        let props = self.props.lock();
        (props.width, props.height)
    }

    /// Current frame rate
    pub fn fps(&self) -> u32 {
        self.props.lock().fps
    }

    /// Closed or force-cleaned; every further operation is refused
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Port reconfiguration in progress
    pub fn in_reconfig(&self) -> bool {
        self.in_reconfig.load(Ordering::Acquire)
    }

    /// Buffer requirements last reported by the engine
    pub fn buffer_requirements(&self) -> Vec<BufferRequirement> {
        self.requirements.lock().clone()
    }

    /// Memory of the internal buffers currently held for `kind`
    pub fn internal_buffers(&self, kind: BufferKind) -> Vec<InternalBufferInfo> {
        let mut lists = self.buffers.lock();
        lists
            .internal_mut(kind)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.buffers.lock().pending.len()
    }

    pub fn stats(&self) -> InstanceStats {
        let mut stats = *self.stats.lock();
        stats.pending = self.pending_len();
        stats
    }

    /// Load this instance contributes for `session_type`, zero outside the loaded range
    pub fn load(&self, session_type: SessionType) -> u64 {
        if self.session_type != session_type || !self.state().is_loaded() {
            return 0;
        }
        let props = self.props.lock();
        macroblock_load(props.width, props.height, props.fps)
    }

    pub(crate) fn core(&self) -> Result<Arc<Core>> {
        self.core.upgrade().ok_or_else(|| Error::CoreUnavailable {
            state: CoreState::Uninit,
            context: format!("instance {} outlived its core", self.id),
        })
    }

    pub(crate) fn ensure_attached(&self, operation: &'static str) -> Result<()> {
        if self.is_detached() {
            return Err(Error::InvalidState {
                operation,
                state: self.state(),
            });
        }
        Ok(())
    }

    /// Mark detached and wake anything waiting on hardware
    ///
    /// Returns `false` if the instance was already detached.
    fn detach(&self) -> bool {
        if self.detached.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.abort.notify_waiters();
        true
    }

    /// Resolves once the instance is detached
    async fn detached(&self) {
        loop {
            let notified = self.abort.notified();
            if self.is_detached() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for an acknowledgement unless the instance is detached first
    async fn wait_ack(&self, kind: ResponseKind, timeout: Duration) -> Result<Response> {
        tokio::select! {
            waited = self.completions.wait(kind, timeout) => waited,
            _ = self.detached() => Err(Error::SessionInvalidated { kind }),
        }
    }

    fn emit(&self, event: InstanceEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("instance {}: event receiver dropped", self.id);
        }
    }

    /// Move to `to` unless the dispatcher invalidated us in the meantime
    fn advance(&self, operation: &'static str, to: InstanceState) -> Result<()> {
        let mut state = self.state.write();
        if *state == InstanceState::Invalid {
            return Err(Error::InvalidState {
                operation,
                state: InstanceState::Invalid,
            });
        }
        tracing::debug!("instance {}: {:?} -> {:?}", self.id, *state, to);
        *state = to;
        Ok(())
    }

    /// Mark invalid, wake every waiter and notify the owner
    ///
    /// Returns `false` if the instance was already invalid; no second event is sent.
    pub(crate) fn invalidate(&self, event: InstanceEvent) -> bool {
        {
            let mut state = self.state.write();
            if *state == InstanceState::Invalid {
                return false;
            }
            tracing::error!("instance {}: {:?} -> Invalid ({:?})", self.id, *state, event);
            *state = InstanceState::Invalid;
        }
        self.completions.abort_all();
        self.emit(event);
        true
    }

    pub(crate) fn completions(&self) -> &CompletionRegistry {
        &self.completions
    }

    /// Engine finished with a caller buffer
    pub(crate) fn on_buffer_done(&self, port: Port, done: BufferDone) {
        let forwarded = self.buffers.lock().outstanding.remove(&(port, done.buffer_id));
        let Some(mut buffer) = forwarded else {
            tracing::warn!(
                "instance {}: {:?} done for unknown buffer {}",
                self.id,
                port,
                done.buffer_id
            );
            return;
        };
        buffer.filled_len = done.filled_len;
        buffer.offset = done.offset;
        buffer.timestamp_us = done.timestamp_us;
        buffer.flags = done.flags;

        {
            let mut stats = self.stats.lock();
            match port {
                Port::Input => stats.inputs_done += 1,
                Port::Output => stats.outputs_done += 1,
            }
        }
        self.emit(match port {
            Port::Input => InstanceEvent::InputDone(buffer),
            Port::Output => InstanceEvent::OutputDone(buffer),
        });
    }

    /// Sequence header landed in the encoder's first output buffer
    pub(crate) fn on_sequence_header(&self, mut done: BufferDone) {
        done.flags |= FrameFlags::CODEC_CONFIG;
        self.on_buffer_done(Port::Output, done);
    }

    /// Track output timing; returns `true` when fps changed enough to re-vote
    pub(crate) fn observe_output_timestamp(&self, timestamp_us: i64, threshold: u32) -> bool {
        let mut props = self.props.lock();
        let previous = props.prev_output_ts.replace(timestamp_us);
        let Some(observed) = previous.and_then(|prev| fps_from_interval(timestamp_us - prev)) else {
            return false;
        };
        if observed.abs_diff(props.fps) > threshold {
            tracing::debug!("instance {}: fps {} -> {}", self.id, props.fps, observed);
            props.fps = observed;
            return true;
        }
        false
    }

    pub(crate) fn on_port_change(&self, change: PortChange) {
        {
            let mut props = self.props.lock();
            props.width = change.width;
            props.height = change.height;
        }
        self.in_reconfig.store(true, Ordering::Release);
        tracing::info!(
            "instance {}: port settings changed to {}x{} (sufficient: {})",
            self.id,
            change.width,
            change.height,
            change.sufficient
        );
        self.emit(InstanceEvent::PortSettingsChanged(change));
    }

    pub(crate) fn on_flush_done(&self, scope: FlushScope) {
        self.in_reconfig.store(false, Ordering::Release);
        self.emit(InstanceEvent::FlushDone { scope });
    }
}
