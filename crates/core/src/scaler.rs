//! Load accounting and clock/bus votes
//!
//! Load is macroblocks per second: `width * height * fps / 256`. Votes
//! are always recomputed from the full aggregate; an instance's properties are
//! read under its own short lock while the collection lock is held, so the
//! sum is best effort under concurrent changes.

use std::sync::atomic::Ordering;

use crate::engine::Core;
use crate::hfi::{MemPath, SessionType};
use crate::instance::Instance;
use crate::{Error, Result};

const MACROBLOCK_AREA: u64 = 16 * 16;

/// Largest width or height accepted from callers
pub const MAX_DIMENSION: u32 = 16_384;

/// Macroblocks per second for one stream, saturating
pub fn macroblock_load(width: u32, height: u32, fps: u32) -> u64 {
    u64::from(width)
        .saturating_mul(u64::from(height))
        .saturating_mul(u64::from(fps))
        / MACROBLOCK_AREA
}

pub(crate) fn check_frame_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(Error::InvalidArgument(format!(
            "frame size {}x{} outside 1..={}",
            width, height, MAX_DIMENSION
        )));
    }
    Ok(())
}

/// Rounded frame rate implied by the gap between two output timestamps
pub fn fps_from_interval(delta_us: i64) -> Option<u32> {
    if delta_us <= 0 {
        return None;
    }
    let fps = (1_000_000 + delta_us / 2) / delta_us;
    u32::try_from(fps).ok().filter(|fps| *fps > 0)
}

impl Core {
    /// Aggregate load of loaded sessions of `session_type`
    pub fn load(&self, session_type: SessionType) -> u64 {
        self.instances()
            .iter()
            .map(|instance| instance.load(session_type))
            .fold(0, u64::saturating_add)
    }

    /// Load of every loaded session regardless of type
    pub fn total_load(&self) -> u64 {
        self.load(SessionType::Encoder)
            .saturating_add(self.load(SessionType::Decoder))
    }

    /// Vote core clocks for the combined load; failures are logged only
    pub async fn scale_clocks(&self) {
        let load = self.total_load();
        if let Err(e) = self.hw().scale_clocks(load).await {
            tracing::warn!("Clock vote for load {} failed: {}", load, e);
        }
    }

    /// Vote bus bandwidth for one session type on one path; failures are logged only
    pub async fn scale_bus(&self, session_type: SessionType, path: MemPath) {
        let load = self.load(session_type);
        if let Err(e) = self.hw().scale_bus(load, session_type, path).await {
            tracing::warn!(
                "Bus vote {:?}/{:?} for load {} failed: {}",
                session_type,
                path,
                load,
                e
            );
        }
    }

    pub(crate) fn bus_paths(&self) -> &'static [MemPath] {
        if self.config().on_chip_memory {
            &[MemPath::Ddr, MemPath::OnChip]
        } else {
            &[MemPath::Ddr]
        }
    }

    /// Re-vote clocks and every bus path from the current aggregate
    pub async fn rescale(&self) {
        let state = self.state();
        if !state.is_initialized() {
            tracing::debug!("Skipping votes on {:?} core", state);
            return;
        }
        self.scale_clocks().await;
        for session_type in [SessionType::Encoder, SessionType::Decoder] {
            for path in self.bus_paths() {
                self.scale_bus(session_type, *path).await;
            }
        }
    }

    /// Re-vote from a separate task; requests made while one is queued coalesce
    ///
    /// Used by the dispatcher, which must not wait on vote calls.
    pub(crate) fn schedule_rescale(&self) {
        if self.rescale_queued().swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(core) = self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            core.rescale_queued().store(false, Ordering::Release);
            core.rescale().await;
        });
    }

    /// Strict bus vote used while bringing the core up
    pub(crate) async fn vote_bus_strict(&self) -> Result<()> {
        for session_type in [SessionType::Encoder, SessionType::Decoder] {
            for path in self.bus_paths() {
                self.hw()
                    .scale_bus(self.load(session_type), session_type, *path)
                    .await?;
            }
        }
        Ok(())
    }

    /// Drop every vote to zero, best effort
    pub(crate) async fn zero_votes(&self) {
        for session_type in [SessionType::Encoder, SessionType::Decoder] {
            for path in self.bus_paths() {
                if let Err(e) = self.hw().scale_bus(0, session_type, *path).await {
                    tracing::debug!("Zero bus vote {:?}/{:?} failed: {}", session_type, path, e);
                }
            }
        }
        if let Err(e) = self.hw().scale_clocks(0).await {
            tracing::debug!("Zero clock vote failed: {}", e);
        }
    }

    /// Refuse to load a session that would push the core past `max_load`
    pub(crate) fn admit(&self, instance: &Instance) -> Result<()> {
        let Some(max_load) = self.config().max_load else {
            return Ok(());
        };
        let load = self.total_load();
        if load > max_load {
            tracing::warn!(
                "instance {}: load {} exceeds limit {}",
                instance.id(),
                load,
                max_load
            );
            return Err(Error::InsufficientResources(format!(
                "load {} exceeds limit {}",
                load, max_load
            )));
        }
        Ok(())
    }
}
