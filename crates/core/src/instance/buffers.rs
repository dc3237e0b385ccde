//! Caller buffers, flush, internal working memory and session teardown

use std::sync::atomic::Ordering;

use crate::completion::check_status;
use crate::engine::Core;
use crate::hfi::{
    BufferKind, BufferRequirement, FlushScope, FrameDescriptor, FrameFlags, InternalBufferInfo,
    Port, PortMask, Property, Response, ResponseKind, SessionMessage, SessionType,
};
use crate::scaler::check_frame_size;
use crate::state::{CoreState, InstanceState};
use crate::{Error, Result};

use super::{Instance, InstanceEvent, PendingBuffer};

/// Caller-owned frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoBuffer {
    /// Caller identifier, unique per port while the buffer is outstanding
    pub id: u64,
    pub device_addr: u64,
    pub alloc_len: u32,
    pub filled_len: u32,
    pub offset: u32,
    pub timestamp_us: i64,
    pub flags: FrameFlags,
}

impl VideoBuffer {
    /// Empty buffer of `alloc_len` bytes at `device_addr`
    pub fn new(id: u64, device_addr: u64, alloc_len: u32) -> Self {
        Self {
            id,
            device_addr,
            alloc_len,
            filled_len: 0,
            offset: 0,
            timestamp_us: 0,
            flags: FrameFlags::empty(),
        }
    }

    pub fn with_payload(mut self, filled_len: u32, timestamp_us: i64) -> Self {
        self.filled_len = filled_len;
        self.timestamp_us = timestamp_us;
        self
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    fn descriptor(&self) -> FrameDescriptor {
        FrameDescriptor {
            buffer_id: self.id,
            device_addr: self.device_addr,
            alloc_len: self.alloc_len,
            filled_len: self.filled_len,
            offset: self.offset,
            timestamp_us: self.timestamp_us,
            flags: self.flags,
        }
    }
}

impl Instance {
    /// Hand a caller buffer to the session
    ///
    /// Before the session is running the buffer is queued without touching
    /// the hardware; queued buffers go out in order once the start step
    /// completes.
    pub async fn submit_buffer(&self, buffer: VideoBuffer, port: Port) -> Result<()> {
        self.ensure_attached("submit_buffer")?;
        if buffer.filled_len > buffer.alloc_len {
            return Err(Error::InvalidArgument(format!(
                "buffer {}: filled {} > allocated {}",
                buffer.id, buffer.filled_len, buffer.alloc_len
            )));
        }

        {
            let mut lists = self.buffers.lock();
            let state = self.state();
            if state == InstanceState::Invalid {
                return Err(Error::InvalidState {
                    operation: "submit_buffer",
                    state,
                });
            }
            if state != InstanceState::StartDone {
                lists.pending.push_back(PendingBuffer { port, buffer });
                tracing::debug!(
                    "instance {}: queued {:?} buffer {} in {:?} ({} pending)",
                    self.id,
                    port,
                    buffer.id,
                    state,
                    lists.pending.len()
                );
                return Ok(());
            }
        }

        let core = self.core()?;
        self.forward(&core, port, buffer).await
    }

    /// Send one buffer to the engine
    async fn forward(&self, core: &Core, port: Port, buffer: VideoBuffer) -> Result<()> {
        let sequence_header = {
            let mut lists = self.buffers.lock();
            lists.outstanding.insert((port, buffer.id), buffer);
            let first_encoder_output = port == Port::Output
                && self.session_type == SessionType::Encoder
                && !lists.seq_header_requested;
            if first_encoder_output {
                lists.seq_header_requested = true;
            }
            first_encoder_output
        };

        let descriptor = buffer.descriptor();
        let hw = core.hw();
        let sent = match port {
            Port::Input => hw.submit_input(self.handle, &descriptor).await,
            Port::Output if sequence_header => {
                tracing::debug!("instance {}: requesting sequence header", self.id);
                hw.get_sequence_header(self.handle, &descriptor).await
            }
            Port::Output => hw.submit_output(self.handle, &descriptor).await,
        };

        if let Err(e) = sent {
            let mut lists = self.buffers.lock();
            lists.outstanding.remove(&(port, buffer.id));
            if sequence_header {
                lists.seq_header_requested = false;
            }
            return Err(e);
        }

        let mut stats = self.stats.lock();
        match port {
            Port::Input => stats.inputs_submitted += 1,
            Port::Output => stats.outputs_submitted += 1,
        }
        Ok(())
    }

    /// Forward everything queued, then enter `StartDone`
    ///
    /// A queued buffer the engine refuses goes back to the caller.
    ///
    /// The state flips while the buffer lock is held on an empty queue, so a
    /// concurrent submit can never overtake a queued buffer.
    pub(super) async fn drain_pending_and_start(&self, core: &Core) -> Result<()> {
        let mut drained = 0usize;
        loop {
            let next = {
                let mut lists = self.buffers.lock();
                match lists.pending.pop_front() {
                    Some(entry) => entry,
                    None => {
                        self.advance("try_state", InstanceState::StartDone)?;
                        break;
                    }
                }
            };
            match self.forward(core, next.port, next.buffer).await {
                Ok(()) => drained += 1,
                Err(e) => {
                    tracing::warn!(
                        "instance {}: queued buffer {} rejected: {}",
                        self.id,
                        next.buffer.id,
                        e
                    );
                    self.return_buffers([next]);
                }
            }
        }
        if drained > 0 {
            tracing::debug!("instance {}: forwarded {} queued buffers", self.id, drained);
        }
        Ok(())
    }

    fn take_pending(&self, mask: PortMask) -> Vec<PendingBuffer> {
        let mut lists = self.buffers.lock();
        let (taken, kept): (Vec<_>, Vec<_>) = lists
            .pending
            .drain(..)
            .partition(|entry| mask.contains(port_mask(entry.port)));
        lists.pending.extend(kept);
        taken
    }

    fn return_buffers(&self, buffers: impl IntoIterator<Item = PendingBuffer>) -> usize {
        let mut count = 0;
        for PendingBuffer { port, buffer } in buffers {
            self.emit(InstanceEvent::BufferReturned { port, buffer });
            count += 1;
        }
        count
    }

    /// Hand back every buffer the caller still owns through this session
    fn return_all_buffers(&self) -> usize {
        let (pending, outstanding): (Vec<_>, Vec<_>) = {
            let mut lists = self.buffers.lock();
            (
                lists.pending.drain(..).collect(),
                lists.outstanding.drain().collect(),
            )
        };
        let outstanding = outstanding
            .into_iter()
            .map(|((port, _), buffer)| PendingBuffer { port, buffer });
        self.return_buffers(pending.into_iter().chain(outstanding))
    }

    /// Flush the ports in `mask`
    ///
    /// Queued buffers for those ports are returned to the caller and the
    /// engine is asked to return the ones it holds. Flushing only the input
    /// port is not supported.
    pub async fn flush(&self, mask: PortMask) -> Result<()> {
        self.ensure_attached("flush")?;
        if mask.is_empty() {
            return Err(Error::InvalidArgument("empty flush mask".to_string()));
        }
        if mask == PortMask::INPUT {
            return Err(Error::NotSupported("input-only flush".to_string()));
        }
        let scope = if mask.contains(PortMask::INPUT) {
            FlushScope::All
        } else {
            FlushScope::Output
        };

        let core = self.core()?;
        let state = self.state();
        if state == InstanceState::Invalid || core.state() == CoreState::Invalid {
            let returned = self.return_all_buffers();
            tracing::info!(
                "instance {}: flushed {} buffers locally while invalid",
                self.id,
                returned
            );
            self.emit(InstanceEvent::FlushDone { scope });
            return Ok(());
        }

        if self.in_reconfig() && mask == PortMask::OUTPUT {
            let queued = self.pending_len();
            if queued > 0 {
                tracing::warn!(
                    "instance {}: {} buffers still queued during reconfiguration flush",
                    self.id,
                    queued
                );
            }
        }

        let returned = self.return_buffers(self.take_pending(mask));
        tracing::debug!("instance {}: returned {} queued buffers", self.id, returned);

        if !state.has_session() {
            self.emit(InstanceEvent::FlushDone { scope });
            return Ok(());
        }
        core.hw().flush(self.handle, scope).await
    }

    /// Ask the engine for its buffer requirements and remember them
    pub async fn query_buffer_requirements(&self) -> Result<Vec<BufferRequirement>> {
        let _guard = self.transition.lock().await;
        self.query_requirements_locked().await
    }

    async fn query_requirements_locked(&self) -> Result<Vec<BufferRequirement>> {
        self.ensure_attached("query_buffer_requirements")?;
        self.require_session("query_buffer_requirements")?;
        let core = self.core()?;

        self.completions.arm(ResponseKind::PropertyInfo);
        core.hw().get_buffer_requirements(self.handle).await?;
        let response = self
            .wait_ack(ResponseKind::PropertyInfo, core.config().hw_response_timeout())
            .await?;

        let Response::Session {
            message: SessionMessage::PropertyInfo { requirements },
            ..
        } = response
        else {
            return Err(Error::HardwareStatus {
                kind: response.kind(),
                status: u32::MAX,
            });
        };
        tracing::debug!("instance {}: requirements {:?}", self.id, requirements);
        *self.requirements.lock() = requirements.clone();
        Ok(requirements)
    }

    fn require_session(&self, operation: &'static str) -> Result<()> {
        let state = self.state();
        if state.has_session() {
            Ok(())
        } else {
            Err(Error::InvalidState { operation, state })
        }
    }

    /// Allocate scratch buffers sized by the engine
    pub async fn allocate_scratch_buffers(&self) -> Result<usize> {
        self.allocate_internal(BufferKind::Scratch).await
    }

    /// Allocate persist buffers sized by the engine
    pub async fn allocate_persist_buffers(&self) -> Result<usize> {
        self.allocate_internal(BufferKind::Persist).await
    }

    pub async fn release_scratch_buffers(&self) -> Result<()> {
        self.ensure_attached("release_scratch_buffers")?;
        let _guard = self.transition.lock().await;
        self.release_internal_locked(BufferKind::Scratch).await
    }

    pub async fn release_persist_buffers(&self) -> Result<()> {
        self.ensure_attached("release_persist_buffers")?;
        let _guard = self.transition.lock().await;
        self.release_internal_locked(BufferKind::Persist).await
    }

    async fn allocate_internal(&self, kind: BufferKind) -> Result<usize> {
        let _guard = self.transition.lock().await;
        let requirements = self.query_requirements_locked().await?;
        let Some(requirement) = requirements.iter().find(|r| r.kind == kind).copied() else {
            tracing::debug!("instance {}: engine needs no {:?} buffers", self.id, kind);
            return Ok(0);
        };

        self.release_internal_locked(kind).await?;

        let core = self.core()?;
        // count comes from the engine; grow as registrations succeed
        let mut allocated: Vec<InternalBufferInfo> = Vec::new();
        for _ in 0..requirement.count {
            let registered = match core.allocator().allocate(requirement.size, kind) {
                Ok(memory) => {
                    let info = InternalBufferInfo { kind, memory };
                    match core.hw().register_buffer(self.handle, &info).await {
                        Ok(()) => Ok(info),
                        Err(e) => {
                            core.allocator().free(&memory);
                            Err(e)
                        }
                    }
                }
                Err(e) => Err(e),
            };

            match registered {
                Ok(info) => {
                    if let Some(list) = self.buffers.lock().internal_mut(kind) {
                        list.push(info);
                    }
                    allocated.push(info);
                }
                Err(e) => {
                    tracing::warn!(
                        "instance {}: {:?} allocation failed after {} of {}: {}",
                        self.id,
                        kind,
                        allocated.len(),
                        requirement.count,
                        e
                    );
                    self.unwind_allocation(&core, kind, &allocated).await;
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "instance {}: allocated {} {:?} buffers of {} bytes",
            self.id,
            allocated.len(),
            kind,
            requirement.size
        );
        Ok(allocated.len())
    }

    /// Drop the buffers registered by one failed allocation call
    async fn unwind_allocation(&self, core: &Core, kind: BufferKind, allocated: &[InternalBufferInfo]) {
        if let Some(list) = self.buffers.lock().internal_mut(kind) {
            list.retain(|held| !allocated.contains(held));
        }
        for info in allocated {
            if let Err(e) = core.hw().release_buffer(self.handle, info).await {
                tracing::debug!("instance {}: unwind release failed: {}", self.id, e);
            }
            core.allocator().free(&info.memory);
        }
    }

    /// Release every internal buffer of `kind`; caller holds the transition lock
    ///
    /// A healthy session waits for the engine to acknowledge each release
    /// before the memory is freed. An invalid one releases best effort and
    /// always frees.
    pub(super) async fn release_internal_locked(&self, kind: BufferKind) -> Result<()> {
        let mut held = match self.buffers.lock().internal_mut(kind) {
            Some(list) => std::mem::take(list),
            None => return Ok(()),
        };
        if held.is_empty() {
            return Ok(());
        }
        let core = self.core()?;
        let count = held.len();

        while let Some(info) = held.pop() {
            let healthy = self.state() != InstanceState::Invalid;
            let released = if healthy {
                self.release_acknowledged(&core, &info).await
            } else {
                self.release_best_effort(&core, &info).await;
                Ok(())
            };

            match released {
                Err(e) if !e.is_fatal() => {
                    // the engine may still use them; keep them owned
                    held.push(info);
                    if let Some(list) = self.buffers.lock().internal_mut(kind) {
                        list.extend(held);
                    }
                    return Err(e);
                }
                _ => core.allocator().free(&info.memory),
            }
        }

        tracing::debug!("instance {}: released {} {:?} buffers", self.id, count, kind);
        Ok(())
    }

    async fn release_acknowledged(&self, core: &Core, info: &InternalBufferInfo) -> Result<()> {
        self.completions.arm(ResponseKind::ReleaseBufferDone);
        core.hw().release_buffer(self.handle, info).await?;
        let response = self
            .wait_ack(ResponseKind::ReleaseBufferDone, core.config().hw_response_timeout())
            .await?;
        check_status(&response)
    }

    async fn release_best_effort(&self, core: &Core, info: &InternalBufferInfo) {
        if let Err(e) = core.hw().release_buffer(self.handle, info).await {
            tracing::debug!("instance {}: best-effort release failed: {}", self.id, e);
        }
    }

    /// Forward a property to the engine
    ///
    /// Frame size and rate are also applied locally and re-voted.
    pub async fn set_property(&self, property: Property) -> Result<()> {
        match property {
            Property::FrameSize { width, height } => check_frame_size(width, height)?,
            Property::FrameRate(0) => {
                return Err(Error::InvalidArgument("zero frame rate".to_string()));
            }
            _ => {}
        }
        self.ensure_attached("set_property")?;
        let state = self.state();
        if !state.has_session() {
            return Err(Error::InvalidState {
                operation: "set_property",
                state,
            });
        }

        let core = self.core()?;
        core.hw().set_property(self.handle, &property).await?;

        let changed = {
            let mut props = self.props.lock();
            match property {
                Property::FrameSize { width, height } => {
                    let changed = (props.width, props.height) != (width, height);
                    props.width = width;
                    props.height = height;
                    changed
                }
                Property::FrameRate(fps) => {
                    let changed = props.fps != fps;
                    props.fps = fps;
                    changed
                }
                _ => false,
            }
        };
        if changed && self.state().is_loaded() {
            core.rescale().await;
        }
        Ok(())
    }

    /// Unconditional teardown that never waits on the engine
    ///
    /// Wakes any waiter, releases and frees internal memory, returns every
    /// caller buffer, ends the session best effort and detaches from the core.
    pub async fn force_cleanup(&self) -> Result<()> {
        if !self.detach() {
            tracing::debug!("instance {}: already detached", self.id);
            return Ok(());
        }
        self.completions.abort_all();
        let core = self.core()?;
        core.abandon_init(self.id);

        // the walker, if any, has been woken and gives up the lock
        let _guard = self.transition.lock().await;
        tracing::info!("instance {}: forced cleanup from {:?}", self.id, self.state());
        let internal: Vec<InternalBufferInfo> = {
            let mut lists = self.buffers.lock();
            let mut all = std::mem::take(&mut lists.scratch);
            all.append(&mut lists.persist);
            all
        };
        for info in &internal {
            self.release_best_effort(&core, info).await;
            core.allocator().free(&info.memory);
        }

        let returned = self.return_all_buffers();
        if returned > 0 {
            tracing::debug!("instance {}: returned {} buffers", self.id, returned);
        }

        if self.session_open.swap(false, Ordering::AcqRel) {
            if let Err(e) = core.hw().end_session(self.handle).await {
                tracing::debug!("instance {}: best-effort end_session failed: {}", self.id, e);
            }
        }

        *self.state.write() = InstanceState::CloseDone;
        drop(_guard);
        core.remove_instance(self.id).await;
        Ok(())
    }

    /// Tear the session down and detach it from its core
    ///
    /// An invalid session is force-cleaned instead.
    pub async fn close(&self) -> Result<()> {
        if self.is_detached() {
            return Ok(());
        }
        if self.state() == InstanceState::Invalid {
            return self.force_cleanup().await;
        }
        match self.try_state(InstanceState::CloseDone).await {
            Ok(()) => {
                if self.detach() {
                    let core = self.core()?;
                    core.remove_instance(self.id).await;
                }
                Ok(())
            }
            Err(e) if self.state() == InstanceState::Invalid => {
                tracing::warn!("instance {}: invalidated while closing: {}", self.id, e);
                self.force_cleanup().await
            }
            Err(e) => Err(e),
        }
    }
}

fn port_mask(port: Port) -> PortMask {
    match port {
        Port::Input => PortMask::INPUT,
        Port::Output => PortMask::OUTPUT,
    }
}
