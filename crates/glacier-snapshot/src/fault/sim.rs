//! In-process fault watcher with no real memory protection.
//!
//! `SimWatch` records registered ranges, drives the idle callback from a
//! plain driver thread, and lets callers deliver "faults" synchronously
//! via [`SimWatch::touch`]. Tests use it to exercise the loader's
//! concurrent fault/prefetch paths deterministically; it is also a usable
//! (if pointless) watcher on hosts without protection primitives, since
//! the idle driver alone will page everything in.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::{FaultHandler, FaultWatch, IdleOutcome};
use crate::ram::HostPtr;

const IDLE_BACKOFF: Duration = Duration::from_micros(200);

#[derive(Default)]
struct SimState {
    ranges: Vec<(usize, usize)>,
    handler: Option<Arc<dyn FaultHandler>>,
    driver: Option<JoinHandle<()>>,
}

pub struct SimWatch {
    state: Mutex<SimState>,
    running: Arc<AtomicBool>,
    unprotect_calls: AtomicUsize,
}

impl SimWatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            running: Arc::new(AtomicBool::new(false)),
            unprotect_calls: AtomicUsize::new(0),
        }
    }

    /// Delivers a synchronous fault for `addr` on the calling thread,
    /// exactly as a trapping memory access would. Returns `false` when the
    /// watch is not started or `addr` is outside every registered range.
    pub fn touch(&self, addr: usize) -> bool {
        let handler = {
            let state = self.state.lock();
            if !state.ranges.iter().any(|&(b, l)| addr >= b && addr < b + l) {
                return false;
            }
            state.handler.clone()
        };
        match handler {
            Some(handler) => {
                handler.on_fault(addr);
                true
            }
            None => false,
        }
    }

    /// Number of `unprotect` calls observed (one per resident page).
    pub fn unprotected_pages(&self) -> usize {
        self.unprotect_calls.load(Ordering::Acquire)
    }
}

impl Default for SimWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultWatch for SimWatch {
    fn register_range(&self, base: HostPtr, len: usize) -> bool {
        self.state.lock().ranges.push((base.0 as usize, len));
        true
    }

    fn unprotect(&self, _base: HostPtr, _len: usize) {
        self.unprotect_calls.fetch_add(1, Ordering::AcqRel);
    }

    fn start(&self, handler: Arc<dyn FaultHandler>) -> bool {
        let mut state = self.state.lock();
        if state.driver.is_some() {
            return false;
        }
        state.handler = Some(Arc::clone(&handler));
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
        let (driver, _handler) = {
            let mut state = self.state.lock();
            (state.driver.take(), state.handler.take())
        };
        if let Some(driver) = driver {
            let _ = driver.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler {
        faults: AtomicUsize,
        idles: AtomicUsize,
    }

    impl FaultHandler for CountingHandler {
        fn on_fault(&self, _addr: usize) {
            self.faults.fetch_add(1, Ordering::AcqRel);
        }

        fn on_idle(&self) -> IdleOutcome {
            if self.idles.fetch_add(1, Ordering::AcqRel) > 3 {
                IdleOutcome::AllDone
            } else {
                IdleOutcome::RunAgain
            }
        }
    }

    #[test]
    fn drives_idle_until_all_done_and_serves_touches() {
        let watch = SimWatch::new();
        let handler = Arc::new(CountingHandler {
            faults: AtomicUsize::new(0),
            idles: AtomicUsize::new(0),
        });
        assert!(watch.register_range(HostPtr(0x4000 as *mut u8), 0x2000));
        assert!(watch.start(Arc::clone(&handler) as Arc<dyn FaultHandler>));

        assert!(watch.touch(0x4800));
        assert!(!watch.touch(0x9000), "outside every registered range");

        watch.stop();
        assert_eq!(handler.faults.load(Ordering::Acquire), 1);
        assert!(handler.idles.load(Ordering::Acquire) > 3);
    }
}
