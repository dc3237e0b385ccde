//! Asynchronous responses from the engine

use serde::{Deserialize, Serialize};

use super::{BufferRequirement, FlushScope, FrameFlags, SessionHandle};

/// Completion of a caller buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDone {
    pub buffer_id: u64,
    pub filled_len: u32,
    pub offset: u32,
    pub timestamp_us: i64,
    pub flags: FrameFlags,
}

/// Port settings change reported mid-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortChange {
    pub width: u32,
    pub height: u32,
    /// Current output buffers are large enough for the new settings
    pub sufficient: bool,
}

/// Messages addressed to one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    InitDone { status: u32 },
    PropertyInfo { requirements: Vec<BufferRequirement> },
    LoadResourceDone { status: u32 },
    StartDone { status: u32 },
    InputBufferDone(BufferDone),
    OutputBufferDone(BufferDone),
    StopDone { status: u32 },
    ReleaseResourceDone { status: u32 },
    EndDone { status: u32 },
    EventChange(PortChange),
    FlushDone { scope: FlushScope },
    SeqHeaderDone(BufferDone),
    Error { code: u32 },
    ReleaseBufferDone { status: u32 },
}

/// Everything the engine can send back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    SysInitDone { status: u32 },
    SysReleaseResourceDone { status: u32 },
    SysError { code: u32 },
    WatchdogTimeout,
    Session {
        session: SessionHandle,
        message: SessionMessage,
    },
}

/// Discriminant of a [`Response`], used to index completions and handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    SysInitDone,
    SysReleaseResourceDone,
    SysError,
    WatchdogTimeout,
    SessionInitDone,
    PropertyInfo,
    LoadResourceDone,
    StartDone,
    InputBufferDone,
    OutputBufferDone,
    StopDone,
    ReleaseResourceDone,
    EndDone,
    EventChange,
    FlushDone,
    SeqHeaderDone,
    SessionError,
    ReleaseBufferDone,
}

impl ResponseKind {
    /// Number of kinds, the size of every completion registry
    pub const COUNT: usize = 18;

    /// Dense index of the kind
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Success status carried by done messages
pub const STATUS_OK: u32 = 0;

impl SessionMessage {
    pub fn kind(&self) -> ResponseKind {
        match self {
            SessionMessage::InitDone { .. } => ResponseKind::SessionInitDone,
            SessionMessage::PropertyInfo { .. } => ResponseKind::PropertyInfo,
            SessionMessage::LoadResourceDone { .. } => ResponseKind::LoadResourceDone,
            SessionMessage::StartDone { .. } => ResponseKind::StartDone,
            SessionMessage::InputBufferDone(_) => ResponseKind::InputBufferDone,
            SessionMessage::OutputBufferDone(_) => ResponseKind::OutputBufferDone,
            SessionMessage::StopDone { .. } => ResponseKind::StopDone,
            SessionMessage::ReleaseResourceDone { .. } => ResponseKind::ReleaseResourceDone,
            SessionMessage::EndDone { .. } => ResponseKind::EndDone,
            SessionMessage::EventChange(_) => ResponseKind::EventChange,
            SessionMessage::FlushDone { .. } => ResponseKind::FlushDone,
            SessionMessage::SeqHeaderDone(_) => ResponseKind::SeqHeaderDone,
            SessionMessage::Error { .. } => ResponseKind::SessionError,
            SessionMessage::ReleaseBufferDone { .. } => ResponseKind::ReleaseBufferDone,
        }
    }

    /// Status of a plain acknowledgement, `None` for data-carrying messages
    pub fn status(&self) -> Option<u32> {
        match self {
            SessionMessage::InitDone { status }
            | SessionMessage::LoadResourceDone { status }
            | SessionMessage::StartDone { status }
            | SessionMessage::StopDone { status }
            | SessionMessage::ReleaseResourceDone { status }
            | SessionMessage::EndDone { status }
            | SessionMessage::ReleaseBufferDone { status } => Some(*status),
            _ => None,
        }
    }
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::SysInitDone { .. } => ResponseKind::SysInitDone,
            Response::SysReleaseResourceDone { .. } => ResponseKind::SysReleaseResourceDone,
            Response::SysError { .. } => ResponseKind::SysError,
            Response::WatchdogTimeout => ResponseKind::WatchdogTimeout,
            Response::Session { message, .. } => message.kind(),
        }
    }

    /// Shorthand for a session-addressed response
    pub fn session(session: SessionHandle, message: SessionMessage) -> Self {
        Response::Session { session, message }
    }
}
