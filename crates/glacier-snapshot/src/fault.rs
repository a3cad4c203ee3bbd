//! Page-fault watching behind a minimal contract.
//!
//! The demand-paging loader only ever needs three things from the
//! platform: write-protect a range so first touches trap, deliver a
//! synchronous callback for the faulting address, and drive an idle
//! callback whenever no fault is pending so background prefetch can make
//! progress. Everything platform-specific stays behind [`FaultWatch`];
//! the page-table logic never sees a signal or an `mprotect` call, which
//! is also what makes it testable with the in-process [`sim::SimWatch`].

#[cfg(any(target_os = "android", target_os = "linux"))]
pub mod mprotect;
pub mod sim;

use std::sync::Arc;

use crate::ram::HostPtr;

/// What the idle callback tells the watcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// Every page is resident; stop driving idle work.
    AllDone,
    /// Nothing to do right now; wait for the next fault or idle tick.
    Wait,
    /// Progress was made; call again immediately.
    RunAgain,
}

/// Callbacks the loader supplies to the watcher.
pub trait FaultHandler: Send + Sync {
    /// A watched page was touched. Must return only once the page's
    /// contents are resident and the range unprotected; the faulting
    /// thread cannot proceed until then.
    fn on_fault(&self, addr: usize);

    /// Invoked whenever no fault is pending.
    fn on_idle(&self) -> IdleOutcome;
}

/// Platform memory-protection primitive.
///
/// Implementations use interior mutability; the loader and its pipeline
/// threads share one watch through an `Arc`. `stop` must drop the handler
/// registered by `start` (the handler usually owns the watch right back,
/// and dropping it is what breaks that cycle).
pub trait FaultWatch: Send + Sync {
    /// Write-protects `len` bytes at `base`. Returns `false` if the range
    /// cannot be watched, in which case the caller falls back to eager
    /// loading.
    fn register_range(&self, base: HostPtr, len: usize) -> bool;

    /// Lifts protection from a range once its contents are resident.
    fn unprotect(&self, base: HostPtr, len: usize);

    /// Begins delivering fault and idle callbacks to `handler`.
    fn start(&self, handler: Arc<dyn FaultHandler>) -> bool;

    /// Stops delivery, joins any driver thread and drops the handler.
    /// Ranges still protected are made accessible again.
    fn stop(&self);
}

/// The best watcher this host can offer, if any.
pub fn platform_watch() -> Option<Arc<dyn FaultWatch>> {
    #[cfg(any(target_os = "android", target_os = "linux"))]
    {
        Some(Arc::new(mprotect::MprotectWatch::new()))
    }
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    {
        None
    }
}
