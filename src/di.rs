//! Dependency wiring for the suspension engine.
//!
//! The registry, code manager, poke strategy and coordinators are plain
//! injected services; nothing in the crate reaches for a singleton. The
//! container here is the composition root an embedding runtime (or a
//! test) builds once and hands around, plus a thread-local scope so
//! bindings that cannot thread a parameter through still find the right
//! instances.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::abort::ThreadAbortController;
use crate::canary::LockSafetyCanary;
use crate::config::EngineConfig;
use crate::coordinator::SuspensionCoordinator;
use crate::debugger::DebuggerSuspensionCoordinator;
use crate::poker::{select_poker, PortableSuspendOps, SuspendOps, ThreadPoker};
use crate::redirector::SafepointRedirector;
use crate::safepoint_map::{CodeManager, TableCodeManager};
use crate::thread::ThreadRegistry;

/// Composition root for the suspension engine.
pub struct RuntimeContainer {
    registry: ThreadRegistry,
    config: EngineConfig,
    code_manager: Arc<dyn CodeManager>,
    redirector: Arc<SafepointRedirector>,
    poker: Arc<dyn ThreadPoker>,
    coordinator: Mutex<Option<Arc<SuspensionCoordinator>>>,
    debugger: Mutex<Option<Arc<DebuggerSuspensionCoordinator>>>,
    abort_controller: Mutex<Option<Arc<ThreadAbortController>>>,
    canary: Mutex<Option<Arc<LockSafetyCanary>>>,
}

impl RuntimeContainer {
    /// Default wiring: portable OS layer, activation poke strategy, empty
    /// code tables.
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(TableCodeManager::new()),
            Arc::new(PortableSuspendOps::new()),
            EngineConfig::default(),
        )
    }

    /// Wire the engine around a specific platform layer and code manager.
    /// The poke strategy is chosen here, once, by capability detection.
    pub fn with_parts(
        code_manager: Arc<dyn CodeManager>,
        suspend_ops: Arc<dyn SuspendOps>,
        config: EngineConfig,
    ) -> Self {
        let redirector = Arc::new(SafepointRedirector::new(
            suspend_ops,
            Arc::clone(&code_manager),
        ));
        let poker = select_poker(&redirector);

        Self {
            registry: ThreadRegistry::new(),
            config,
            code_manager,
            redirector,
            poker,
            coordinator: Mutex::new(None),
            debugger: Mutex::new(None),
            abort_controller: Mutex::new(None),
            canary: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn code_manager(&self) -> &Arc<dyn CodeManager> {
        &self.code_manager
    }

    pub fn redirector(&self) -> &Arc<SafepointRedirector> {
        &self.redirector
    }

    pub fn poker(&self) -> &Arc<dyn ThreadPoker> {
        &self.poker
    }

    /// Get or create the GC suspension coordinator.
    pub fn coordinator(&self) -> Arc<SuspensionCoordinator> {
        let mut guard = self.coordinator.lock();
        if let Some(ref coordinator) = *guard {
            return Arc::clone(coordinator);
        }
        let coordinator = Arc::new(SuspensionCoordinator::new(
            self.registry.clone(),
            Arc::clone(&self.poker),
            self.config.clone(),
        ));
        *guard = Some(Arc::clone(&coordinator));
        coordinator
    }

    /// Get or create the debugger coordinator (spawns its coordination
    /// thread on first use).
    pub fn debugger(&self) -> Arc<DebuggerSuspensionCoordinator> {
        let mut guard = self.debugger.lock();
        if let Some(ref debugger) = *guard {
            return Arc::clone(debugger);
        }
        let debugger = Arc::new(DebuggerSuspensionCoordinator::new(
            self.registry.clone(),
            Arc::clone(&self.poker),
            self.config.clone(),
        ));
        *guard = Some(Arc::clone(&debugger));
        debugger
    }

    pub fn abort_controller(&self) -> Arc<ThreadAbortController> {
        let mut guard = self.abort_controller.lock();
        if let Some(ref controller) = *guard {
            return Arc::clone(controller);
        }
        let controller = Arc::new(ThreadAbortController::new(
            self.registry.clone(),
            self.config.clone(),
        ));
        *guard = Some(Arc::clone(&controller));
        controller
    }

    /// Get or create the lock-safety canary with a no-op probe. Embedders
    /// that need a real probe install one with
    /// [`set_canary`](Self::set_canary) before first use.
    pub fn canary(&self) -> Arc<LockSafetyCanary> {
        let mut guard = self.canary.lock();
        if let Some(ref canary) = *guard {
            return Arc::clone(canary);
        }
        let canary = Arc::new(LockSafetyCanary::new(self.config.canary_timeout, || {}));
        *guard = Some(Arc::clone(&canary));
        canary
    }

    pub fn set_canary(&self, canary: Arc<LockSafetyCanary>) {
        *self.canary.lock() = Some(canary);
    }
}

impl Default for RuntimeContainer {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide default container, for bindings that cannot thread one
/// through. Prefer passing a [`RuntimeContainer`] explicitly.
static GLOBAL_CONTAINER: Lazy<Arc<RuntimeContainer>> =
    Lazy::new(|| Arc::new(RuntimeContainer::new()));

pub fn global_container() -> &'static Arc<RuntimeContainer> {
    &GLOBAL_CONTAINER
}

// Thread-local container for the current context.
thread_local! {
    static CURRENT_CONTAINER: std::cell::RefCell<Option<Arc<RuntimeContainer>>> = const {
        std::cell::RefCell::new(None)
    };
}

/// Set the container for the current thread context.
pub fn set_current_container(container: Arc<RuntimeContainer>) {
    CURRENT_CONTAINER.with(|current| {
        *current.borrow_mut() = Some(container);
    });
}

/// Get the current container, creating a default one if none is set.
pub fn current_container() -> Arc<RuntimeContainer> {
    CURRENT_CONTAINER.with(|current| {
        if let Some(ref container) = *current.borrow() {
            return Arc::clone(container);
        }
        let fresh = Arc::new(RuntimeContainer::new());
        *current.borrow_mut() = Some(Arc::clone(&fresh));
        fresh
    })
}

/// Clear the current container (test cleanup).
pub fn clear_current_container() {
    CURRENT_CONTAINER.with(|current| {
        *current.borrow_mut() = None;
    });
}

/// RAII guard scoping a container to the current thread.
pub struct ContainerScope {
    _phantom: std::marker::PhantomData<()>,
}

impl ContainerScope {
    pub fn new(container: Arc<RuntimeContainer>) -> Self {
        set_current_container(container);
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl Drop for ContainerScope {
    fn drop(&mut self) {
        clear_current_container();
    }
}
