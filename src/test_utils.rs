//! Shared fixtures for unit and integration tests.
//!
//! [`VirtualSuspendOps`] stands in for the platform layer: per-thread
//! virtual CPUs whose contexts tests program directly, with recorded
//! suspend depths and priorities. Applying a context that resumes at the
//! redirect stub posts an activation, which is exactly how a virtual
//! thread "resumes at the stub" on its next poll.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::context::RegisterContext;
use crate::coordinator::SuspensionCoordinator;
use crate::debugger::DebuggerSuspensionCoordinator;
use crate::error::{SuspendError, SuspendResult};
use crate::poker::{select_poker, PortableSuspendOps, SuspendOps};
use crate::redirector::SafepointRedirector;
use crate::safepoint_map::{MethodId, SafepointMap, TableCodeManager};
use crate::thread::{ManagedThread, ThreadRegistry};

#[derive(Debug, Clone)]
struct VirtualCpu {
    context: Option<RegisterContext>,
    suspend_depth: usize,
    priority: i32,
    fail_next_suspend: bool,
    fail_next_install: bool,
}

impl Default for VirtualCpu {
    fn default() -> Self {
        Self {
            context: None,
            suspend_depth: 0,
            priority: 0,
            fail_next_suspend: false,
            fail_next_install: false,
        }
    }
}

/// Platform layer backed by programmable per-thread virtual CPUs.
/// Reports support for direct suspension, so capability detection selects
/// the suspend+redirect strategy.
#[derive(Default)]
pub struct VirtualSuspendOps {
    cpus: DashMap<u64, Mutex<VirtualCpu>>,
}

impl VirtualSuspendOps {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_cpu<R>(&self, thread: &ManagedThread, body: impl FnOnce(&mut VirtualCpu) -> R) -> R {
        let entry = self.cpus.entry(thread.id()).or_default();
        let mut cpu = entry.lock();
        body(&mut cpu)
    }

    /// Program where the virtual thread is currently executing.
    pub fn program_context(&self, thread: &ManagedThread, context: RegisterContext) {
        self.with_cpu(thread, |cpu| cpu.context = Some(context));
    }

    /// The context most recently written back, if any.
    pub fn installed_context(&self, thread: &ManagedThread) -> Option<RegisterContext> {
        self.with_cpu(thread, |cpu| cpu.context)
    }

    pub fn suspend_depth(&self, thread: &ManagedThread) -> usize {
        self.with_cpu(thread, |cpu| cpu.suspend_depth)
    }

    pub fn set_priority(&self, thread: &ManagedThread, priority: i32) {
        self.with_cpu(thread, |cpu| cpu.priority = priority);
    }

    pub fn priority(&self, thread: &ManagedThread) -> i32 {
        self.with_cpu(thread, |cpu| cpu.priority)
    }

    /// Make the next suspend of `thread` fail, as an exiting thread would.
    pub fn fail_next_suspend(&self, thread: &ManagedThread) {
        self.with_cpu(thread, |cpu| cpu.fail_next_suspend = true);
    }

    /// Make the next context write-back fail.
    pub fn fail_next_install(&self, thread: &ManagedThread) {
        self.with_cpu(thread, |cpu| cpu.fail_next_install = true);
    }
}

impl SuspendOps for VirtualSuspendOps {
    fn supports_suspension(&self) -> bool {
        true
    }

    fn suspend(&self, thread: &ManagedThread) -> SuspendResult<()> {
        if thread.is_detached() {
            return Err(SuspendError::SuspendFailed);
        }
        self.with_cpu(thread, |cpu| {
            if cpu.fail_next_suspend {
                cpu.fail_next_suspend = false;
                return Err(SuspendError::SuspendFailed);
            }
            cpu.suspend_depth += 1;
            Ok(())
        })
    }

    fn resume(&self, thread: &ManagedThread) {
        self.with_cpu(thread, |cpu| {
            cpu.suspend_depth = cpu.suspend_depth.saturating_sub(1);
        });
    }

    fn capture_context(&self, thread: &ManagedThread) -> SuspendResult<RegisterContext> {
        self.with_cpu(thread, |cpu| cpu.context.ok_or(SuspendError::ContextUnsafe))
    }

    fn apply_context(
        &self,
        thread: &ManagedThread,
        context: &RegisterContext,
    ) -> SuspendResult<()> {
        self.with_cpu(thread, |cpu| {
            if cpu.fail_next_install {
                cpu.fail_next_install = false;
                return Err(SuspendError::RedirectInstallFailed);
            }
            cpu.context = Some(*context);
            Ok(())
        })?;

        if context.position.is_redirect_stub() {
            // The virtual thread resumes at the stub on its next poll.
            thread.post_activation();
        }
        Ok(())
    }

    fn flush_write_buffers(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    fn boost_priority(&self, thread: &ManagedThread) -> Option<i32> {
        self.with_cpu(thread, |cpu| {
            if cpu.priority < 0 {
                let previous = cpu.priority;
                cpu.priority = 0;
                Some(previous)
            } else {
                None
            }
        })
    }

    fn restore_priority(&self, thread: &ManagedThread, priority: i32) {
        self.set_priority(thread, priority);
    }
}

/// Ready-wired engine for tests.
pub struct TestFixture {
    pub registry: ThreadRegistry,
    pub code: Arc<TableCodeManager>,
    pub coordinator: Arc<SuspensionCoordinator>,
    pub virtual_ops: Option<Arc<VirtualSuspendOps>>,
    config: EngineConfig,
    debugger: Mutex<Option<Arc<DebuggerSuspensionCoordinator>>>,
}

impl TestFixture {
    /// Activation-strategy fixture over the portable platform layer; the
    /// configuration that real targets run with.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let registry = ThreadRegistry::new();
        let code = Arc::new(TableCodeManager::new());
        let code_dyn: Arc<dyn crate::safepoint_map::CodeManager> = code.clone();
        let redirector = Arc::new(SafepointRedirector::new(
            Arc::new(PortableSuspendOps::new()),
            code_dyn,
        ));
        let poker = select_poker(&redirector);
        let coordinator = Arc::new(SuspensionCoordinator::new(
            registry.clone(),
            Arc::clone(&poker),
            config.clone(),
        ));

        Self {
            registry,
            code,
            coordinator,
            virtual_ops: None,
            config,
            debugger: Mutex::new(None),
        }
    }

    /// Suspend+redirect fixture over virtual CPUs, for exercising the
    /// direct-suspension fallback without OS support.
    pub fn new_virtual() -> Self {
        let registry = ThreadRegistry::new();
        let code = Arc::new(TableCodeManager::new());
        // One interruptible method covers most scripted scenarios.
        code.install(MethodId(1), SafepointMap::fully_interruptible(0, u32::MAX));

        let ops = Arc::new(VirtualSuspendOps::new());
        let ops_dyn: Arc<dyn SuspendOps> = ops.clone();
        let code_dyn: Arc<dyn crate::safepoint_map::CodeManager> = code.clone();
        let redirector = Arc::new(SafepointRedirector::new(ops_dyn, code_dyn));
        let poker = select_poker(&redirector);
        let config = EngineConfig::default();
        let coordinator = Arc::new(SuspensionCoordinator::new(
            registry.clone(),
            Arc::clone(&poker),
            config.clone(),
        ));

        Self {
            registry,
            code,
            coordinator,
            virtual_ops: Some(ops),
            config,
            debugger: Mutex::new(None),
        }
    }

    /// The debugger coordinator for this fixture, created on first use.
    pub fn debugger(&self) -> Arc<DebuggerSuspensionCoordinator> {
        let mut guard = self.debugger.lock();
        if let Some(ref debugger) = *guard {
            return Arc::clone(debugger);
        }
        let debugger = Arc::new(DebuggerSuspensionCoordinator::new(
            self.registry.clone(),
            Arc::clone(self.coordinator.poker()),
            self.config.clone(),
        ));
        *guard = Some(Arc::clone(&debugger));
        debugger
    }

    pub fn abort_controller(&self) -> crate::abort::ThreadAbortController {
        crate::abort::ThreadAbortController::new(self.registry.clone(), self.config.clone())
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
