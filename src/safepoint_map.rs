//! Safe-point query contract against JIT-compiled code.
//!
//! The JIT/code manager owns the binary format of its safe-point tables;
//! this module only defines the query surface the suspension engine needs:
//! for a (method, offset) pair, is the offset GC-interruptible, is the
//! method fully interruptible, and does the offset fall inside the prolog
//! or epilog (where the frame is not yet/no longer walkable).

use dashmap::DashMap;

/// Opaque identifier for a compiled method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

/// Pseudo-method the redirector installs as a resumption target. Never
/// present in any code manager's tables.
pub const REDIRECT_STUB_METHOD: MethodId = MethodId(u32::MAX);

/// An instruction position in compiled managed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodePosition {
    pub method: MethodId,
    pub offset: u32,
}

impl CodePosition {
    /// The resumption point the redirector installs.
    pub fn redirect_stub() -> Self {
        Self {
            method: REDIRECT_STUB_METHOD,
            offset: 0,
        }
    }

    pub fn is_redirect_stub(&self) -> bool {
        self.method == REDIRECT_STUB_METHOD
    }
}

/// A half-open `[start, end)` byte-offset range of interruptible code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptibleRange {
    pub start: u32,
    pub end: u32,
}

impl InterruptibleRange {
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.start && offset < self.end
    }
}

/// Per-method safe-point table as produced by the JIT.
///
/// # Examples
///
/// ```
/// use stopworld::safepoint_map::SafepointMap;
///
/// let map = SafepointMap::fully_interruptible(8, 120);
/// assert!(map.query(64).gc_safe);
/// assert!(!map.query(4).gc_safe); // prolog
/// ```
#[derive(Debug, Clone)]
pub struct SafepointMap {
    ranges: Vec<InterruptibleRange>,
    fully_interruptible: bool,
    prolog_end: u32,
    epilog_start: u32,
}

/// Answer to a (method, offset) safe-point query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafepointQuery {
    /// The offset is a valid point to stop the thread for a scan.
    pub gc_safe: bool,
    /// Every offset in the method body is a valid safe point.
    pub fully_interruptible: bool,
    /// The offset falls inside the prolog or epilog.
    pub in_prolog_or_epilog: bool,
}

impl SafepointMap {
    /// Build a table for partially interruptible code.
    pub fn new(
        ranges: Vec<InterruptibleRange>,
        prolog_end: u32,
        epilog_start: u32,
    ) -> Self {
        Self {
            ranges,
            fully_interruptible: false,
            prolog_end,
            epilog_start,
        }
    }

    /// Build a table for fully interruptible code: every offset between the
    /// prolog and epilog is a safe point.
    pub fn fully_interruptible(prolog_end: u32, epilog_start: u32) -> Self {
        Self {
            ranges: Vec::new(),
            fully_interruptible: true,
            prolog_end,
            epilog_start,
        }
    }

    pub fn is_fully_interruptible(&self) -> bool {
        self.fully_interruptible
    }

    pub fn query(&self, offset: u32) -> SafepointQuery {
        let in_prolog_or_epilog = offset < self.prolog_end || offset >= self.epilog_start;
        let in_body_range = self.fully_interruptible
            || self.ranges.iter().any(|range| range.contains(offset));

        SafepointQuery {
            gc_safe: in_body_range && !in_prolog_or_epilog,
            fully_interruptible: self.fully_interruptible,
            in_prolog_or_epilog,
        }
    }
}

/// Query interface the suspension engine uses against the JIT's tables.
///
/// Implemented by the code manager of the embedding runtime; the engine
/// never inspects the underlying format.
pub trait CodeManager: Send + Sync {
    /// Resolve a (method, offset) pair. `None` means the offset is not in
    /// managed code at all (runtime stubs, native frames) and therefore not
    /// redirectable.
    fn safepoint_query(&self, method: MethodId, offset: u32) -> Option<SafepointQuery>;
}

/// Table-backed [`CodeManager`] for embedders and tests.
///
/// # Examples
///
/// ```
/// use stopworld::safepoint_map::{CodeManager, MethodId, SafepointMap, TableCodeManager};
///
/// let manager = TableCodeManager::new();
/// manager.install(MethodId(1), SafepointMap::fully_interruptible(0, u32::MAX));
/// assert!(manager.safepoint_query(MethodId(1), 100).unwrap().gc_safe);
/// assert!(manager.safepoint_query(MethodId(2), 100).is_none());
/// ```
#[derive(Debug, Default)]
pub struct TableCodeManager {
    methods: DashMap<MethodId, SafepointMap>,
}

impl TableCodeManager {
    pub fn new() -> Self {
        Self {
            methods: DashMap::new(),
        }
    }

    /// Install (or replace) the table for a method.
    pub fn install(&self, method: MethodId, map: SafepointMap) {
        self.methods.insert(method, map);
    }

    /// Drop a method's table, e.g. after code pitching.
    pub fn evict(&self, method: MethodId) {
        self.methods.remove(&method);
    }
}

impl CodeManager for TableCodeManager {
    fn safepoint_query(&self, method: MethodId, offset: u32) -> Option<SafepointQuery> {
        self.methods.get(&method).map(|map| map.query(offset))
    }
}
