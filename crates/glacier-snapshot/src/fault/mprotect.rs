//! `mprotect` + SIGSEGV fault watcher for Linux/Android hosts.
//!
//! Registered ranges are mapped `PROT_NONE`; the first touch of a page
//! traps into a process-wide SIGSEGV handler which resolves the address
//! against the active watch and forwards it as a synchronous fault. Idle
//! callbacks are driven from a plain polling thread, the same shape as
//! [`super::sim::SimWatch`].
//!
//! Signal handlers are process-global, so at most one `MprotectWatch`
//! may be started at a time; `start` fails when another one is active.
//! The active registry is published before any range can fault and is
//! immutable afterwards, so the handler's read lock is uncontended.
//!
//! The handler itself is not async-signal-safe: it takes the `ACTIVE`
//! read lock and the forwarded fault does disk I/O. That works here
//! because SIGSEGV is delivered synchronously to the faulting thread,
//! and watched faults only occur between `start` and `stop`. The one
//! hazard is a thread faulting on a watched page while `start` or
//! `stop` holds the `ACTIVE` write lock, which would deadlock; callers
//! must not let guest threads touch watched memory during those calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::{FaultHandler, FaultWatch, IdleOutcome};
use crate::ram::HostPtr;

const IDLE_BACKOFF: Duration = Duration::from_micros(200);

struct ActiveState {
    ranges: Vec<(usize, usize)>,
    handler: Arc<dyn FaultHandler>,
}

static ACTIVE: RwLock<Option<Arc<ActiveState>>> = RwLock::new(None);

unsafe extern "C" fn on_segv(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // SAFETY: the kernel passes a valid siginfo_t for SA_SIGINFO handlers.
    let addr = unsafe { (*info).si_addr() } as usize;
    let state = ACTIVE.read().clone();
    if let Some(state) = state
        && state.ranges.iter().any(|&(b, l)| addr >= b && addr < b + l)
    {
        state.handler.on_fault(addr);
        return;
    }
    // Not a watched address: restore the default disposition so the
    // re-raised fault produces a normal crash instead of a handler loop.
    // SAFETY: signal() is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGSEGV, libc::SIG_DFL);
    }
}

fn host_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v <= 0 { 4096 } else { v as usize }
}

/// (aligned base, aligned length) covering `[base, base + len)`.
fn aligned_span(base: usize, len: usize, page: usize) -> (usize, usize) {
    let start = base & !(page - 1);
    let end = (base + len).div_ceil(page) * page;
    (start, end - start)
}

fn protect(base: usize, len: usize, prot: libc::c_int) -> bool {
    let (start, span) = aligned_span(base, len, host_page_size());
    // SAFETY: the VM guarantees the registered mapping covers this span
    // for the lifetime of the watch.
    unsafe { libc::mprotect(start as *mut libc::c_void, span, prot) == 0 }
}

#[derive(Default)]
struct WatchState {
    ranges: Vec<(usize, usize)>,
    driver: Option<JoinHandle<()>>,
}

pub struct MprotectWatch {
    state: Mutex<WatchState>,
    running: Arc<AtomicBool>,
}

impl MprotectWatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WatchState::default()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn install_segv_handler() {
        // SAFETY: sigaction with a zeroed struct plus our SA_SIGINFO
        // handler; the previous disposition for SIGSEGV is the default
        // (crash), which on_segv restores for unwatched addresses.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            let handler: unsafe extern "C" fn(
                libc::c_int,
                *mut libc::siginfo_t,
                *mut libc::c_void,
            ) = on_segv;
            sa.sa_sigaction = handler as usize;
            sa.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut());
        }
    }
}

impl Default for MprotectWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultWatch for MprotectWatch {
    fn register_range(&self, base: HostPtr, len: usize) -> bool {
        let base = base.0 as usize;
        if !protect(base, len, libc::PROT_NONE) {
            tracing::warn!(base, len, "mprotect(PROT_NONE) failed; range not watched");
            return false;
        }
        self.state.lock().ranges.push((base, len));
        true
    }

    fn unprotect(&self, base: HostPtr, len: usize) {
        protect(base.0 as usize, len, libc::PROT_READ | libc::PROT_WRITE);
    }

    fn start(&self, handler: Arc<dyn FaultHandler>) -> bool {
        let mut state = self.state.lock();
        if state.driver.is_some() {
            return false;
        }
        {
            let mut active = ACTIVE.write();
            if active.is_some() {
                tracing::warn!("another fault watch is already active in this process");
                return false;
            }
            *active = Some(Arc::new(ActiveState {
                ranges: state.ranges.clone(),
                handler: Arc::clone(&handler),
            }));
        }
        Self::install_segv_handler();

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        state.driver = Some(thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                match handler.on_idle() {
                    IdleOutcome::RunAgain => {}
                    IdleOutcome::Wait => thread::sleep(IDLE_BACKOFF),
                    IdleOutcome::AllDone => break,
                }
            }
        }));
        true
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let (driver, ranges) = {
            let mut state = self.state.lock();
            (state.driver.take(), std::mem::take(&mut state.ranges))
        };
        if let Some(driver) = driver {
            let _ = driver.join();
        }
        *ACTIVE.write() = None;
        // An interrupted load leaves some pages protected; make the guest
        // mapping usable again before handing it back to the VM.
        for (base, len) in ranges {
            protect(base, len, libc::PROT_READ | libc::PROT_WRITE);
        }
    }
}
