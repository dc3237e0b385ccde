//! The video core: one hardware engine and the sessions sharing it
//!
//! A [`Core`] owns the instance collection, the engine-wide completions
//! (core init, on-chip release) and the task that dispatches hardware
//! responses. Core-level transitions are serialized by an async mutex; the
//! instance collection sits behind its own short lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::completion::{check_status, CompletionRegistry};
use crate::config::CoreConfig;
use crate::dispatcher;
use crate::hfi::{HardwareInterface, ResponseKind, ResponseReceiver, RestartKind, SessionHandle};
use crate::instance::{Instance, InstanceEvent, SessionConfig};
use crate::memory::BufferAllocator;
use crate::scaler::check_frame_size;
use crate::state::CoreState;
use crate::{Error, Result};

/// One hardware video engine
pub struct Core {
    hw: Arc<dyn HardwareInterface>,
    allocator: Arc<dyn BufferAllocator>,
    config: CoreConfig,
    state: RwLock<CoreState>,
    /// Serializes init and release
    transition: tokio::sync::Mutex<()>,
    instances: RwLock<Vec<Arc<Instance>>>,
    completions: CompletionRegistry,
    next_instance_id: AtomicU64,
    /// Bytes of on-chip memory currently allocated
    on_chip: Mutex<Option<u64>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    /// A re-vote task is queued and has not started reading loads
    rescale_queued: AtomicBool,
    weak_self: Weak<Core>,
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("state", &self.state())
            .field("instances", &self.instance_count())
            .field("config", &self.config)
            .finish()
    }
}

impl Core {
    /// Create a core and spawn its response dispatcher
    ///
    /// `responses` is the receiving half of the channel whose sender was given
    /// to `hw`. Must be called from within a tokio runtime.
    pub fn start(
        hw: Arc<dyn HardwareInterface>,
        allocator: Arc<dyn BufferAllocator>,
        config: CoreConfig,
        responses: ResponseReceiver,
    ) -> Arc<Self> {
        let core = Arc::new_cyclic(|weak_self| Core {
            hw,
            allocator,
            config,
            state: RwLock::new(CoreState::Uninit),
            transition: tokio::sync::Mutex::new(()),
            instances: RwLock::new(Vec::new()),
            completions: CompletionRegistry::new("core"),
            next_instance_id: AtomicU64::new(1),
            on_chip: Mutex::new(None),
            dispatcher: Mutex::new(None),
            rescale_queued: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        let task = tokio::spawn(dispatcher::run(Arc::downgrade(&core), responses));
        *core.dispatcher.lock() = Some(task);
        tracing::info!("Video core started");
        core
    }

    pub fn state(&self) -> CoreState {
        *self.state.read()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub(crate) fn hw(&self) -> &dyn HardwareInterface {
        self.hw.as_ref()
    }

    pub(crate) fn allocator(&self) -> &dyn BufferAllocator {
        self.allocator.as_ref()
    }

    pub(crate) fn completions(&self) -> &CompletionRegistry {
        &self.completions
    }

    pub(crate) fn rescale_queued(&self) -> &AtomicBool {
        &self.rescale_queued
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Core>> {
        self.weak_self.upgrade()
    }

    /// Collection lock; never hold it across an await
    pub(crate) fn instances(&self) -> RwLockReadGuard<'_, Vec<Arc<Instance>>> {
        self.instances.read()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    pub fn instance(&self, id: u64) -> Option<Arc<Instance>> {
        self.instances.read().iter().find(|i| i.id() == id).cloned()
    }

    pub(crate) fn instance_by_session(&self, session: SessionHandle) -> Option<Arc<Instance>> {
        self.instances
            .read()
            .iter()
            .find(|i| i.handle() == session)
            .cloned()
    }

    /// Open a new session on this core
    ///
    /// The instance starts in `Uninit`; drive it with [`Instance::try_state`].
    /// Events for the session arrive on the returned receiver.
    pub fn open_instance(
        &self,
        config: SessionConfig,
    ) -> Result<(Arc<Instance>, mpsc::UnboundedReceiver<InstanceEvent>)> {
        check_frame_size(config.width, config.height)?;
        if config.fps == Some(0) {
            return Err(Error::InvalidArgument("zero frame rate".to_string()));
        }
        let state = self.state();
        if state == CoreState::Invalid {
            return Err(Error::CoreUnavailable {
                state,
                context: "cannot open a session".to_string(),
            });
        }

        let id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        let fps = config.fps.unwrap_or(self.config.default_fps);
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = Arc::new(Instance::new(id, self.weak_self.clone(), &config, fps, tx));
        self.instances.write().push(instance.clone());

        tracing::info!(
            "Opened {:?} {:?} instance {} at {}x{}@{}",
            config.session_type,
            config.codec,
            id,
            config.width,
            config.height,
            fps
        );
        Ok((instance, rx))
    }

    /// Bring the engine up
    ///
    /// Votes bus, loads firmware, votes clocks, then issues core-init and waits
    /// for its acknowledgement. A no-op once initialized. Any failure undoes
    /// the earlier steps and leaves the core uninitialized.
    pub async fn init(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        match self.state() {
            CoreState::Init | CoreState::InitDone => return Ok(()),
            CoreState::Invalid => {
                return Err(Error::CoreUnavailable {
                    state: CoreState::Invalid,
                    context: "core init".to_string(),
                })
            }
            CoreState::Uninit => {}
        }
        tracing::info!("Initializing video core");

        if let Err(e) = self.vote_bus_strict().await {
            self.zero_votes().await;
            return Err(e);
        }
        if let Err(e) = self.hw.load_firmware().await {
            self.zero_votes().await;
            return Err(e);
        }
        if let Err(e) = self.hw.scale_clocks(self.total_load()).await {
            self.unwind_init(false).await;
            return Err(e);
        }

        self.completions.arm(ResponseKind::SysInitDone);
        if let Err(e) = self.hw.init_core().await {
            self.unwind_init(false).await;
            return Err(e);
        }
        self.swap_state(CoreState::Uninit, CoreState::Init);

        let acked = self
            .completions
            .wait(ResponseKind::SysInitDone, self.config.hw_response_timeout())
            .await
            .and_then(|response| check_status(&response));
        if let Err(e) = acked {
            tracing::warn!("Core init failed: {}", e);
            self.unwind_init(true).await;
            self.swap_state(CoreState::Init, CoreState::Uninit);
            return Err(e);
        }

        self.swap_state(CoreState::Init, CoreState::InitDone);
        tracing::info!("Video core initialized");
        Ok(())
    }

    async fn unwind_init(&self, core_issued: bool) {
        if core_issued {
            if let Err(e) = self.hw.release_core().await {
                tracing::debug!("Unwind release_core failed: {}", e);
            }
        }
        if let Err(e) = self.hw.unload_firmware().await {
            tracing::debug!("Unwind unload_firmware failed: {}", e);
        }
        self.zero_votes().await;
    }

    /// Compare-and-set that never leaves `Invalid`
    fn swap_state(&self, from: CoreState, to: CoreState) -> bool {
        let mut state = self.state.write();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Allocate on-chip memory once for the whole core
    pub(crate) async fn ensure_on_chip_memory(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        if self.on_chip.lock().is_some() {
            return Ok(());
        }
        let size = self.hw.on_chip_memory_size().await?;
        self.hw.alloc_on_chip_memory(size).await?;
        *self.on_chip.lock() = Some(size);
        tracing::info!("Allocated {} bytes of on-chip memory", size);
        Ok(())
    }

    /// On-chip memory currently allocated, in bytes
    pub fn on_chip_memory(&self) -> Option<u64> {
        *self.on_chip.lock()
    }

    /// Detach an instance; the last one out releases the engine
    pub(crate) async fn remove_instance(&self, id: u64) {
        let now_empty = {
            let mut instances = self.instances.write();
            instances.retain(|i| i.id() != id);
            instances.is_empty()
        };
        tracing::info!("Removed instance {}", id);
        if now_empty {
            self.release().await;
        } else {
            self.rescale().await;
        }
    }

    /// Release the engine once no instance is left
    ///
    /// A healthy core releases on-chip memory in an orderly way first; an
    /// invalid one skips straight to freeing it.
    async fn release(&self) {
        let _guard = self.transition.lock().await;
        if !self.instances.read().is_empty() {
            return;
        }
        let state = self.state();
        if state == CoreState::Uninit {
            return;
        }
        let healthy = state != CoreState::Invalid;
        tracing::info!("Releasing video core from {:?}", state);

        self.zero_votes().await;

        let on_chip = self.on_chip.lock().take();
        if on_chip.is_some() {
            if healthy {
                if let Err(e) = self.release_on_chip_orderly().await {
                    tracing::warn!("Orderly on-chip release failed: {}", e);
                }
            }
            if let Err(e) = self.hw.free_on_chip_memory().await {
                tracing::warn!("Freeing on-chip memory failed: {}", e);
            }
        }

        if let Err(e) = self.hw.release_core().await {
            tracing::warn!("release_core failed: {}", e);
        }
        if let Err(e) = self.hw.unload_firmware().await {
            tracing::warn!("unload_firmware failed: {}", e);
        }
        *self.state.write() = CoreState::Uninit;
        tracing::info!("Video core released");
    }

    async fn release_on_chip_orderly(&self) -> Result<()> {
        self.completions.arm(ResponseKind::SysReleaseResourceDone);
        self.hw.release_on_chip_memory().await?;
        let response = self
            .completions
            .wait(
                ResponseKind::SysReleaseResourceDone,
                self.config.hw_response_timeout(),
            )
            .await?;
        check_status(&response)
    }

    /// Invalidate the core and every instance on it
    ///
    /// With no instance left to close, the core is released right away so it
    /// can be brought up again.
    pub(crate) fn escalate_fatal(&self, code: Option<u32>) {
        let instances: Vec<Arc<Instance>> = self.instances.read().clone();
        let previous = {
            let mut state = self.state.write();
            if *state == CoreState::Uninit && instances.is_empty() {
                tracing::warn!("Fatal engine error {:?} on an idle core, ignoring", code);
                return;
            }
            std::mem::replace(&mut *state, CoreState::Invalid)
        };
        tracing::error!("Fatal engine error {:?}, core {:?} -> Invalid", code, previous);
        self.completions.abort_all();

        if instances.is_empty() {
            self.schedule_release();
            return;
        }
        let notified = instances
            .iter()
            .filter(|instance| instance.invalidate(InstanceEvent::SysError { code }))
            .count();
        tracing::error!("Invalidated {} of {} instances", notified, instances.len());
    }

    fn schedule_release(&self) {
        let Some(core) = self.upgrade() else {
            return;
        };
        tokio::spawn(async move { core.release().await });
    }

    /// Stop a pending core init that only `instance_id` is waiting for
    ///
    /// Used by forced cleanup so the core unwinds instead of waiting out the
    /// response timeout.
    pub(crate) fn abandon_init(&self, instance_id: u64) {
        let sole = {
            let instances = self.instances.read();
            instances.len() == 1 && instances[0].id() == instance_id
        };
        if sole && self.completions.abort(ResponseKind::SysInitDone) {
            tracing::info!("Abandoned core init for instance {}", instance_id);
        }
    }

    /// Ask the platform to restart the engine subsystem
    ///
    /// Only allowed while the core is initialized and healthy. The engine's
    /// resulting error report invalidates the core through the dispatcher.
    pub async fn trigger_subsystem_restart(&self, kind: RestartKind) -> Result<()> {
        let state = self.state();
        if !state.is_initialized() {
            return Err(Error::CoreUnavailable {
                state,
                context: format!("subsystem restart {:?}", kind),
            });
        }
        tracing::warn!("Triggering {:?} subsystem restart", kind);
        self.hw.trigger_subsystem_restart(kind).await
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.get_mut().take() {
            task.abort();
        }
    }
}
