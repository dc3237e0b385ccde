//! Memory allocator used for scratch and persist buffers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::hfi::BufferKind;
use crate::{Error, Result};

/// Allocated region as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle {
    /// Allocator-unique identifier
    pub id: u64,
    /// Size in bytes
    pub size: u64,
    /// Address the engine uses to reach the region
    pub device_addr: u64,
}

/// Allocator collaborator
///
/// Implementations must be usable from any task; allocation never suspends.
pub trait BufferAllocator: Send + Sync {
    /// Allocate `size` bytes for a buffer of `kind`
    fn allocate(&self, size: u64, kind: BufferKind) -> Result<MemoryHandle>;

    /// Return a region; freeing an unknown handle is a no-op
    fn free(&self, handle: &MemoryHandle);
}

/// Configuration for [`PoolAllocator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum bytes outstanding at once
    pub max_bytes: u64,
    /// First device address handed out
    pub base_addr: u64,
    /// Alignment of every region in bytes
    pub alignment: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024, // 512MB
            base_addr: 0x1000_0000,
            alignment: 4096,
        }
    }
}

/// Allocator metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatorMetrics {
    /// Active regions
    pub regions_active: usize,
    /// Bytes currently allocated
    pub bytes_allocated: u64,
    /// Total allocations
    pub allocations_total: u64,
    /// Total frees
    pub frees_total: u64,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    size: u64,
    kind: BufferKind,
}

/// Bump allocator with a byte budget and per-kind accounting
///
/// Device addresses are never reused, which makes stale handles easy to spot
/// in engine traces.
#[derive(Debug)]
pub struct PoolAllocator {
    config: PoolConfig,
    next_id: AtomicU64,
    next_addr: AtomicU64,
    regions: RwLock<HashMap<u64, Region>>,
    kind_usage: RwLock<HashMap<BufferKind, u64>>,
    metrics: RwLock<AllocatorMetrics>,
}

impl PoolAllocator {
    /// Create a pool
    pub fn new(config: PoolConfig) -> Self {
        let base = config.base_addr;
        Self {
            config,
            next_id: AtomicU64::new(1),
            next_addr: AtomicU64::new(base),
            regions: RwLock::new(HashMap::new()),
            kind_usage: RwLock::new(HashMap::new()),
            metrics: RwLock::new(AllocatorMetrics::default()),
        }
    }

    /// Snapshot of the allocator metrics
    pub fn metrics(&self) -> AllocatorMetrics {
        self.metrics.read().clone()
    }

    /// Bytes currently held by buffers of `kind`
    pub fn kind_usage(&self, kind: BufferKind) -> u64 {
        self.kind_usage.read().get(&kind).copied().unwrap_or(0)
    }

    fn aligned(&self, size: u64) -> u64 {
        let align = self.config.alignment.max(1);
        size.div_ceil(align) * align
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl BufferAllocator for PoolAllocator {
    fn allocate(&self, size: u64, kind: BufferKind) -> Result<MemoryHandle> {
        if size == 0 {
            return Err(Error::InvalidArgument(format!(
                "zero-sized {:?} allocation",
                kind
            )));
        }

        {
            let mut metrics = self.metrics.write();
            if metrics.bytes_allocated.saturating_add(size) > self.config.max_bytes {
                return Err(Error::AllocationFailed(format!(
                    "Memory limit exceeded: {} + {} > {}",
                    metrics.bytes_allocated, size, self.config.max_bytes
                )));
            }
            metrics.regions_active += 1;
            metrics.bytes_allocated += size;
            metrics.allocations_total += 1;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let device_addr = self
            .next_addr
            .fetch_add(self.aligned(size), Ordering::Relaxed);

        self.regions.write().insert(id, Region { size, kind });
        *self.kind_usage.write().entry(kind).or_insert(0) += size;

        tracing::debug!(
            "Allocated {:?} region {}: {} bytes at {:#x}",
            kind,
            id,
            size,
            device_addr
        );

        Ok(MemoryHandle {
            id,
            size,
            device_addr,
        })
    }

    fn free(&self, handle: &MemoryHandle) {
        let Some(region) = self.regions.write().remove(&handle.id) else {
            tracing::warn!("Free of unknown region {}", handle.id);
            return;
        };

        if let Some(usage) = self.kind_usage.write().get_mut(&region.kind) {
            *usage = usage.saturating_sub(region.size);
        }

        let mut metrics = self.metrics.write();
        metrics.regions_active = metrics.regions_active.saturating_sub(1);
        metrics.bytes_allocated = metrics.bytes_allocated.saturating_sub(region.size);
        metrics.frees_total += 1;

        tracing::debug!("Freed region {} ({} bytes)", handle.id, region.size);
    }
}
