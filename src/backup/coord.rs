//! The coordination context
//!
//! One mutex guards all shared pipeline state (the work queue, the pool's
//! lifecycle flags, the prefetch slots and the fault flags), and one
//! condvar is notified on every state transition. Every waiter loops
//! re-checking its own predicate together with the fault flags, so a
//! raised fault always wakes blocked threads for re-evaluation instead of
//! deadlocking them, and a cleared fault wakes them to resume.
//!
//! The fault signals model two process-wide conditions: connectivity loss
//! and a full disk. Any thread may raise one; the raising thread then owns
//! the recovery probe loop and clears the flag once the probe succeeds.
//! While a flag is up, all participating threads block; none of their
//! in-flight work is lost.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::backup::pool::Work;
use crate::source::{FetchOutcome, FetchRequest};

/// How often a raised fault re-probes for recovery
const RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Global shutdown flag, set on the first SIGINT/SIGTERM
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Installs signal handlers for cooperative shutdown
///
/// The first signal sets the shutdown flag and restores the default
/// handler, so a second signal terminates immediately.
pub fn install_signal_handlers() {
    #[cfg(unix)]
    unsafe {
        libc::signal(
            libc::SIGTERM,
            unix_signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            unix_signal_handler as *const () as libc::sighandler_t,
        );
    }
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

/// A process-wide fault condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NoInternet,
    DiskFull,
}

impl FaultKind {
    fn index(self) -> usize {
        match self {
            Self::NoInternet => 0,
            Self::DiskFull => 1,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::NoInternet => "no internet connectivity",
            Self::DiskFull => "no space left on device",
        }
    }
}

/// A health probe: returns `true` once the fault condition has cleared
pub type Probe = Box<dyn Fn() -> bool + Send + Sync>;

/// All shared mutable pipeline state, under the one lock
pub(crate) struct Shared {
    // Work queue / pool lifecycle
    pub(crate) queue: VecDeque<Work>,
    pub(crate) unfinished: usize,
    pub(crate) quit: bool,
    pub(crate) abort: bool,
    pub(crate) errors: bool,

    // Fault signals, indexed by FaultKind
    pub(crate) faults: [bool; 2],
    /// Set on cancel: fault waits return immediately so threads can exit
    pub(crate) destroyed: bool,

    // Single-slot asynchronous fetch call
    pub(crate) fetch_request: Option<FetchRequest>,
    pub(crate) fetch_outcome: Option<FetchOutcome>,
    pub(crate) fetch_quit: bool,
}

impl Shared {
    pub(crate) fn faulted(&self) -> bool {
        self.faults.iter().any(|&f| f)
    }
}

/// The coordination context shared by the driver, the API helper thread
/// and every pool worker
pub struct Coord {
    pub(crate) shared: Mutex<Shared>,
    pub(crate) cond: Condvar,
    probes: [Probe; 2],
    recheck: Duration,
    interrupt: AtomicBool,
}

impl Coord {
    /// A context with the default probes: a TCP connectivity check for
    /// no-internet, and plain time for disk-full (retrying surfaces the
    /// error again if space is still short)
    pub fn new() -> Arc<Self> {
        Self::with_config(
            [Box::new(default_connectivity_probe), Box::new(|| true)],
            RECHECK_INTERVAL,
        )
    }

    /// A context whose disk-full probe tests writability of the given
    /// archive root
    pub fn for_archive(root: PathBuf) -> Arc<Self> {
        let disk: Probe = Box::new(move || disk_space_probe(&root));
        Self::with_config(
            [Box::new(default_connectivity_probe), disk],
            RECHECK_INTERVAL,
        )
    }

    pub fn with_config(probes: [Probe; 2], recheck: Duration) -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(Shared {
                queue: VecDeque::new(),
                unfinished: 0,
                quit: false,
                abort: false,
                errors: false,
                faults: [false; 2],
                destroyed: false,
                fetch_request: None,
                fetch_outcome: None,
                fetch_quit: false,
            }),
            cond: Condvar::new(),
            probes,
            recheck,
            interrupt: AtomicBool::new(false),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    pub(crate) fn wait<'a>(&self, guard: MutexGuard<'a, Shared>) -> MutexGuard<'a, Shared> {
        self.cond.wait(guard).unwrap()
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Runs the given fault's health probe once
    pub fn probe_healthy(&self, kind: FaultKind) -> bool {
        (self.probes[kind.index()])()
    }

    /// Raises a fault and blocks until it clears
    ///
    /// The first thread to raise a fault owns its recovery loop: it
    /// re-probes on an interval and clears the flag once the probe
    /// succeeds. Any other thread raising the same fault just waits it
    /// out. Either way the caller returns once the fault is down (or the
    /// context was destroyed by a cancel) and retries its operation.
    pub fn raise(&self, kind: FaultKind) {
        let i = kind.index();
        {
            let mut shared = self.lock();
            if shared.destroyed {
                return;
            }
            if shared.faults[i] {
                // Someone else is probing; wait with everyone else
                while shared.faults[i] && !shared.destroyed {
                    shared = self.wait(shared);
                }
                return;
            }
            shared.faults[i] = true;
            tracing::warn!("{}; all work paused until it clears", kind.describe());
            self.notify_all();
        }

        loop {
            std::thread::sleep(self.recheck);
            let mut shared = self.lock();
            if shared.destroyed || self.probe_healthy(kind) {
                shared.faults[i] = false;
                if !shared.destroyed {
                    tracing::info!("{} cleared, resuming", kind.describe());
                }
                self.notify_all();
                return;
            }
        }
    }

    /// Blocks while any fault is raised
    pub fn block_on_faults(&self) {
        let mut shared = self.lock();
        while shared.faulted() && !shared.destroyed {
            shared = self.wait(shared);
        }
    }

    /// Whether the context was torn down by a cancel; retry loops must
    /// give up instead of re-raising faults
    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Whether an interrupt (signal or explicit request) is pending
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst) || SHUTDOWN.load(Ordering::SeqCst)
    }

    /// Requests cooperative shutdown of this run; used by tests and the
    /// signal path
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.notify_all();
    }
}

/// `true` once a small probe file can be written under the archive root
fn disk_space_probe(root: &Path) -> bool {
    use std::io::Write;
    if !root.exists() {
        return true; // nothing to probe yet
    }
    match tempfile::Builder::new().prefix(".space.").tempfile_in(root) {
        Ok(mut probe) => probe
            .write_all(&[0u8; 4096])
            .and_then(|_| probe.flush())
            .is_ok(),
        Err(_) => false,
    }
}

/// `true` when a well-known resolver accepts a TCP connection
fn default_connectivity_probe() -> bool {
    const RESOLVERS: &[&str] = &["1.1.1.1:53", "8.8.8.8:53"];
    RESOLVERS.iter().any(|addr| {
        addr.parse::<SocketAddr>().is_ok_and(|addr| {
            TcpStream::connect_timeout(&addr, Duration::from_secs(5)).is_ok()
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn instant_coord(healthy: Arc<AtomicBool>) -> Arc<Coord> {
        let probe = Box::new(move || healthy.load(Ordering::SeqCst));
        Coord::with_config([probe, Box::new(|| true)], Duration::from_millis(10))
    }

    #[test]
    fn test_raise_blocks_until_probe_clears() {
        let healthy = Arc::new(AtomicBool::new(false));
        let coord = instant_coord(healthy.clone());

        let c = coord.clone();
        let raiser = std::thread::spawn(move || c.raise(FaultKind::NoInternet));

        // The fault must be visible while the probe fails
        std::thread::sleep(Duration::from_millis(50));
        assert!(coord.lock().faulted());

        healthy.store(true, Ordering::SeqCst);
        raiser.join().unwrap();
        assert!(!coord.lock().faulted());
    }

    #[test]
    fn test_block_on_faults_wakes_on_clear() {
        let healthy = Arc::new(AtomicBool::new(false));
        let coord = instant_coord(healthy.clone());

        let c = coord.clone();
        let raiser = std::thread::spawn(move || c.raise(FaultKind::NoInternet));
        std::thread::sleep(Duration::from_millis(30));

        let c = coord.clone();
        let counted = Arc::new(AtomicUsize::new(0));
        let n = counted.clone();
        let waiter = std::thread::spawn(move || {
            c.block_on_faults();
            n.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counted.load(Ordering::SeqCst), 0);

        healthy.store(true, Ordering::SeqCst);
        raiser.join().unwrap();
        waiter.join().unwrap();
        assert_eq!(counted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_raiser_waits_out_the_first() {
        let healthy = Arc::new(AtomicBool::new(false));
        let coord = instant_coord(healthy.clone());

        let c1 = coord.clone();
        let first = std::thread::spawn(move || c1.raise(FaultKind::NoInternet));
        std::thread::sleep(Duration::from_millis(30));

        let c2 = coord.clone();
        let second = std::thread::spawn(move || c2.raise(FaultKind::NoInternet));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!second.is_finished());

        healthy.store(true, Ordering::SeqCst);
        first.join().unwrap();
        second.join().unwrap();
    }

    #[test]
    fn test_destroyed_releases_fault_waiters() {
        let healthy = Arc::new(AtomicBool::new(false));
        let coord = instant_coord(healthy);

        let c = coord.clone();
        let raiser = std::thread::spawn(move || c.raise(FaultKind::NoInternet));
        std::thread::sleep(Duration::from_millis(30));

        {
            let mut shared = coord.lock();
            shared.destroyed = true;
            coord.notify_all();
        }
        raiser.join().unwrap();
    }

    #[test]
    fn test_interrupt_flag() {
        let coord = Coord::new();
        assert!(!coord.interrupted());
        coord.request_interrupt();
        assert!(coord.interrupted());
    }
}
