//! The explicit context handle that replaces the global mutable singletons
//! called out in `spec.md` §9 ("current compilation, verbose-compilation
//! flag, adapter cache ... should be passed explicitly through a
//! `CompilerContext` handle").

use crate::adapter::{AdapterCache, AdapterStub, Signature};
use crate::settings::Settings;
use std::sync::Arc;

/// Carries everything a compilation needs that used to live in a global:
/// the flags, and a handle to the process-wide adapter cache. One
/// `CompilerContext` is built per process (or per test) and shared by
/// reference across however many methods compile concurrently.
#[derive(Clone)]
pub struct CompilerContext {
    pub settings: Settings,
    adapters: Arc<AdapterCache>,
}

impl CompilerContext {
    pub fn new(settings: Settings) -> Self {
        CompilerContext { settings, adapters: Arc::new(AdapterCache::new()) }
    }

    /// Fetch a cached adapter stub for `sig`, or build and publish one via
    /// `build`. `build` runs at most once per distinct signature even under
    /// concurrent compilation.
    pub fn adapter_for(
        &self,
        sig: Signature,
        build: impl FnOnce() -> AdapterStub,
    ) -> Arc<AdapterStub> {
        self.adapters.get_or_insert(sig, build)
    }
}

impl Default for CompilerContext {
    fn default() -> Self {
        CompilerContext::new(Settings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterDirection, AdapterFrameLayout};
    use crate::debuginfo::RefBitmap;

    #[test]
    fn adapter_cache_is_shared_through_the_context() {
        let ctx = CompilerContext::default();
        let sig = Signature { arg_kinds: vec![], direction: AdapterDirection::BaselineToOptimized };
        let built = std::sync::atomic::AtomicUsize::new(0);
        let make = || {
            built.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            AdapterStub {
                code: vec![0u8; 4],
                frame: AdapterFrameLayout { frame_words: 0, ref_bits: RefBitmap::new(0) },
            }
        };
        let a = ctx.adapter_for(sig.clone(), make);
        let b = ctx.adapter_for(sig, make);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(built.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
