//! Explicit compilation flags.
//!
//! `spec.md` §9 calls out "global mutable singletons (current compilation,
//! verbose-compilation flag, adapter cache)" as a pattern to re-architect:
//! they should be passed explicitly through a context handle instead. This
//! module is the flags half of that; [`crate::context::CompilerContext`] is
//! the handle that carries them (plus the adapter cache and per-thread
//! compilation stack) through a compilation.

/// Which linear-scan tie-break strategy to use when splitting at a blocked
/// position with no use information to prefer one split point over another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    /// Split as early as legally possible.
    Earliest,
    /// Prefer splitting at block boundaries, then no-use positions, then the
    /// latest `shouldHaveRegister` -- the default described in `spec.md`.
    BlockBoundaryFirst,
}

impl Default for SplitStrategy {
    fn default() -> Self {
        SplitStrategy::BlockBoundaryFirst
    }
}

/// Flags controlling one compilation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Verify reference maps at every safepoint after allocation. Independent of the `verify-refmaps`
    /// Cargo feature so tests can force it on regardless of build profile.
    pub verify_refmaps: bool,
    /// Run the linear-scan checker pass that asserts invariant 1 of
    /// `spec.md` §8 (every opId covered by exactly one split child) after
    /// allocation completes.
    pub verify_intervals: bool,
    /// Tie-break strategy used when choosing a split position.
    pub split_strategy: SplitStrategy,
    /// Emit a `log::trace!` line per walk-phase step. Expensive; off by
    /// default even in debug builds.
    pub trace_regalloc: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            verify_refmaps: cfg!(feature = "verify-refmaps") || cfg!(debug_assertions),
            verify_intervals: cfg!(debug_assertions),
            split_strategy: SplitStrategy::default(),
            trace_regalloc: false,
        }
    }
}

impl Settings {
    /// Flags tuned for unit/integration tests: verification on, tracing off.
    pub fn for_tests() -> Self {
        Settings {
            verify_refmaps: true,
            verify_intervals: true,
            ..Settings::default()
        }
    }
}
