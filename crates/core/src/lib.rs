//! Video core - session management for a shared hardware video engine
//!
//! This crate coordinates concurrent encode and decode sessions running on one
//! hardware engine reached through an asynchronous command/response interface.
//!
//! # Architecture
//!
//! - [`hfi`]: the hardware interface boundary ([`HardwareInterface`] commands,
//!   [`Response`] messages)
//! - [`completion`]: one-shot slots correlating commands with responses
//! - [`state`]: the session ladder and the two directional step tables
//! - [`Instance`]: one session, its transitions and its buffers
//! - [`Core`]: the engine, its sessions, core-level init/release and fatal
//!   error escalation
//! - [`scaler`]: load accounting and clock/bus votes
//! - [`CoreRegistry`]: caller-owned arena of attached cores
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vidc_core::{hfi, Codec, Core, CoreConfig, InstanceState, PoolAllocator, SessionConfig};
//!
//! let (tx, rx) = hfi::response_channel();
//! let hw = Arc::new(MyEngine::new(tx));
//! let core = Core::start(hw, Arc::new(PoolAllocator::default()), CoreConfig::default(), rx);
//!
//! let (session, mut events) = core.open_instance(SessionConfig::decoder(Codec::Hevc, 1920, 1080))?;
//! session.try_state(InstanceState::StartDone).await?;
//! ```

#![warn(clippy::all)]

pub mod completion;
pub mod config;
mod dispatcher;
pub mod engine;
mod error;
pub mod hfi;
pub mod instance;
pub mod memory;
pub mod registry;
pub mod scaler;
pub mod state;

pub use config::CoreConfig;
pub use engine::Core;
pub use error::{Error, Result};
pub use hfi::{
    Codec, FlushScope, FrameFlags, HardwareInterface, Port, PortMask, Property, Response,
    ResponseKind, ResponseSender, SessionType,
};
pub use instance::{Instance, InstanceEvent, InstanceStats, SessionConfig, VideoBuffer};
pub use memory::{BufferAllocator, MemoryHandle, PoolAllocator, PoolConfig};
pub use registry::{CoreId, CoreRegistry};
pub use state::{CoreState, InstanceState};

/// Initialize logging for the video core
///
/// Installs a `tracing` fmt subscriber filtered by `RUST_LOG` (default
/// `info`). Calling it again once a subscriber is installed is harmless.
pub fn init() -> Result<()> {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Video core logging initialized");
    }
    Ok(())
}
