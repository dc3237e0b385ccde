//! Hardware interface boundary
//!
//! The video core never talks to the engine directly. Commands go out through
//! [`HardwareInterface`]; answers come back asynchronously as [`Response`]
//! values pushed into a [`ResponseSender`], which the dispatcher drains.
//!
//! The exact wire encoding of commands is owned by the implementor.

pub mod message;

pub use message::{BufferDone, PortChange, Response, ResponseKind, SessionMessage, STATUS_OK};

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::memory::MemoryHandle;
use crate::Result;

/// Opaque session handle known to the hardware
///
/// The core allocates it before session-init so responses can be routed
/// even when they arrive before the command call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle(pub u64);

/// Kind of session running on the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    Encoder,
    Decoder,
}

/// Coded format of the bitstream side of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Mpeg2,
}

/// Caller-facing buffer queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Port {
    /// Frames going into the engine (bitstream for a decoder, raw for an encoder)
    Input,
    /// Frames coming out of the engine
    Output,
}

bitflags! {
    /// Set of ports a flush applies to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PortMask: u8 {
        /// Input port
        const INPUT = 0b0000_0001;
        /// Output port
        const OUTPUT = 0b0000_0010;
    }
}

bitflags! {
    /// Per-frame flags carried to and from the engine
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        /// Last buffer of the stream
        const END_OF_STREAM = 0b0000_0001;
        /// Buffer carries codec configuration (sequence header)
        const CODEC_CONFIG = 0b0000_0010;
        /// Frame can be decoded without references
        const SYNC_FRAME = 0b0000_0100;
        /// Engine could not decode the frame
        const DATA_CORRUPT = 0b0000_1000;
    }
}

/// Scope of a hardware flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushScope {
    Output,
    All,
}

/// Memory path a bus vote applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemPath {
    /// Main system memory
    Ddr,
    /// On-chip memory, when the engine has one
    OnChip,
}

/// Kind of buffer the engine reports requirements for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    Input,
    Output,
    /// Working memory that can be reallocated between sessions phases
    Scratch,
    /// Working memory that must live as long as the session
    Persist,
}

/// Buffer requirement reported by the engine for one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRequirement {
    pub kind: BufferKind,
    pub count: u32,
    pub size: u64,
}

/// Hardware-agnostic description of a caller buffer handed to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Caller's identifier, echoed back in the done message
    pub buffer_id: u64,
    pub device_addr: u64,
    pub alloc_len: u32,
    pub filled_len: u32,
    pub offset: u32,
    pub timestamp_us: i64,
    pub flags: FrameFlags,
}

/// Internal buffer as registered with the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalBufferInfo {
    pub kind: BufferKind,
    pub memory: MemoryHandle,
}

/// Session property forwarded to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    FrameSize { width: u32, height: u32 },
    /// Frames per second
    FrameRate(u32),
    /// Bits per second
    Bitrate(u32),
    /// Anything the core does not interpret
    Raw { id: u32, data: Vec<u8> },
}

/// Subsystem restart flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartKind {
    Fatal,
    DivideByZero,
    Watchdog,
}

/// Command entry points of the engine
///
/// Each method only submits the command. Completion, where the engine sends
/// one, arrives later through the [`ResponseSender`] handed to the implementor.
/// An `Err` return means the command was rejected outright.
#[async_trait]
pub trait HardwareInterface: Send + Sync {
    async fn load_firmware(&self) -> Result<()>;
    async fn unload_firmware(&self) -> Result<()>;
    /// Answered by `SysInitDone`
    async fn init_core(&self) -> Result<()>;
    async fn release_core(&self) -> Result<()>;

    /// Answered by `SessionInitDone`
    async fn init_session(&self, session: SessionHandle, session_type: SessionType, codec: Codec) -> Result<()>;
    /// Answered by `LoadResourceDone`
    async fn load_resources(&self, session: SessionHandle) -> Result<()>;
    /// Answered by `StartDone`
    async fn start_session(&self, session: SessionHandle) -> Result<()>;
    /// Answered by `StopDone`
    async fn stop_session(&self, session: SessionHandle) -> Result<()>;
    /// Answered by `ReleaseResourceDone`
    async fn release_resources(&self, session: SessionHandle) -> Result<()>;
    /// Answered by `EndDone`
    async fn end_session(&self, session: SessionHandle) -> Result<()>;

    /// Answered by `InputBufferDone`
    async fn submit_input(&self, session: SessionHandle, frame: &FrameDescriptor) -> Result<()>;
    /// Answered by `OutputBufferDone`
    async fn submit_output(&self, session: SessionHandle, frame: &FrameDescriptor) -> Result<()>;
    /// Answered by `SeqHeaderDone`
    async fn get_sequence_header(&self, session: SessionHandle, frame: &FrameDescriptor) -> Result<()>;

    async fn register_buffer(&self, session: SessionHandle, buffer: &InternalBufferInfo) -> Result<()>;
    /// Answered by `ReleaseBufferDone`
    async fn release_buffer(&self, session: SessionHandle, buffer: &InternalBufferInfo) -> Result<()>;
    /// Answered by `PropertyInfo`
    async fn get_buffer_requirements(&self, session: SessionHandle) -> Result<()>;
    async fn set_property(&self, session: SessionHandle, property: &Property) -> Result<()>;
    /// Answered by `FlushDone`
    async fn flush(&self, session: SessionHandle, scope: FlushScope) -> Result<()>;

    async fn scale_clocks(&self, load: u64) -> Result<()>;
    async fn scale_bus(&self, load: u64, session_type: SessionType, path: MemPath) -> Result<()>;

    /// Size in bytes of the engine's on-chip memory
    async fn on_chip_memory_size(&self) -> Result<u64>;
    async fn alloc_on_chip_memory(&self, size: u64) -> Result<()>;
    /// Orderly release, answered by `SysReleaseResourceDone`
    async fn release_on_chip_memory(&self) -> Result<()>;
    async fn free_on_chip_memory(&self) -> Result<()>;

    async fn trigger_subsystem_restart(&self, kind: RestartKind) -> Result<()>;
}

/// Cloneable handle the hardware interface uses to deliver responses
///
/// Sending never blocks; responses queue until the dispatcher drains them.
#[derive(Debug, Clone)]
pub struct ResponseSender {
    tx: mpsc::UnboundedSender<Response>,
}

impl ResponseSender {
    /// Deliver a response to the dispatcher
    ///
    /// Returns `false` if the core has been dropped.
    pub fn send(&self, response: Response) -> bool {
        match self.tx.send(response) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Dropping {:?}: dispatcher is gone", e.0.kind());
                false
            }
        }
    }
}

/// Receiving side consumed by [`crate::Core::start`]
#[derive(Debug)]
pub struct ResponseReceiver {
    pub(crate) rx: mpsc::UnboundedReceiver<Response>,
}

/// Create the channel linking a hardware interface to its core
pub fn response_channel() -> (ResponseSender, ResponseReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResponseSender { tx }, ResponseReceiver { rx })
}
