//! Deadline supervision for blocking VS4L calls
//!
//! Calls run on a small set of long-lived `vs4l-call` threads while the
//! caller waits on a channel in `interval` steps, logging a warning at every
//! step. When the accumulated wait reaches the deadline the caller returns
//! [`AccelError::Timeout`] and the call thread is left to finish on its own;
//! it owns everything it touches, so nothing it references goes away
//! underneath the kernel.
//!
//! A call thread parks itself in the idle list after each call and is handed
//! the next one from there. A thread stuck past a deadline is simply not
//! idle, so later calls go to another thread, spawned on demand.
//!
//! ```text
//! caller ──pop idle / spawn──▶ vs4l-call thread ── ioctl ... ──▶ send(result), park
//!   │ recv_timeout(interval)   warn "target:20s, cur:1s"
//!   │ recv_timeout(interval)   warn "target:20s, cur:2s"
//!   ▼ ... deadline             error, Err(Timeout)
//! ```

use crate::error::{AccelError, Result};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Parked call threads kept beyond this are let go
const MAX_IDLE: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One call handed to a call thread, with the sender that reaches it again
struct Call {
    job: Job,
    home: Sender<Call>,
}

type IdleList = Mutex<Vec<Sender<Call>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn call_loop(calls: &mpsc::Receiver<Call>, idle: &Weak<IdleList>) {
    while let Ok(Call { job, home }) = calls.recv() {
        job();
        let Some(idle) = idle.upgrade() else {
            break;
        };
        let mut idle = lock(&idle);
        if idle.len() >= MAX_IDLE {
            break;
        }
        idle.push(home);
    }
    debug!("vs4l call thread exiting");
}

/// Watchdog shared by every call of one link
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    interval: Duration,
    idle: Arc<IdleList>,
}

impl Watchdog {
    /// Create a watchdog. A zero `timeout` disables supervision.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        let interval = if interval.is_zero() { timeout } else { interval };
        Self {
            timeout,
            interval,
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Deadline per call
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call threads parked and ready for the next call
    pub fn idle_threads(&self) -> usize {
        lock(&self.idle).len()
    }

    fn dispatch(&self, mut job: Job) -> Result<()> {
        loop {
            let parked = lock(&self.idle).pop();
            let Some(thread) = parked else {
                break;
            };
            match thread.send(Call {
                job,
                home: thread.clone(),
            }) {
                Ok(()) => return Ok(()),
                // That thread is gone; try the next one
                Err(mpsc::SendError(call)) => job = call.job,
            }
        }

        let (tx, rx) = mpsc::channel();
        let idle = Arc::downgrade(&self.idle);
        std::thread::Builder::new()
            .name("vs4l-call".into())
            .spawn(move || call_loop(&rx, &idle))?;
        debug!("spawned a vs4l call thread");
        tx.send(Call {
            job,
            home: tx.clone(),
        })
        .map_err(|_| AccelError::invalid_state("VS4L call thread exited at start"))
    }

    /// Run `job` under the deadline
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::Timeout`] when the deadline passes, or an I/O
    /// error if no call thread is idle and a new one cannot be spawned.
    pub fn supervise<T, F>(&self, request: &'static str, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.timeout.is_zero() {
            return Ok(job());
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.dispatch(Box::new(move || {
            // Receiver is gone after a timeout.
            let _ = tx.send(job());
        }))?;

        let start = Instant::now();
        loop {
            match rx.recv_timeout(self.interval) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AccelError::invalid_state(format!(
                        "VS4L {request} call thread exited without a result"
                    )));
                }
                Err(RecvTimeoutError::Timeout) => {
                    let elapsed = start.elapsed();
                    if elapsed >= self.timeout {
                        error!(
                            "VS4L {request} timeout! target:{}s, cur:{}s",
                            self.timeout.as_secs_f32(),
                            elapsed.as_secs_f32()
                        );
                        return Err(AccelError::Timeout {
                            request,
                            duration_ms: u64::try_from(self.timeout.as_millis())
                                .unwrap_or(u64::MAX),
                        });
                    }
                    warn!(
                        "VS4L {request} timeout warning! target:{}s, cur:{}s",
                        self.timeout.as_secs_f32(),
                        elapsed.as_secs_f32()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Watchdog {
        Watchdog::new(Duration::from_millis(60), Duration::from_millis(10))
    }

    #[test]
    fn quick_job_returns_its_value() {
        assert_eq!(fast().supervise("QBUF", || 7).unwrap(), 7);
    }

    #[test]
    fn slow_job_times_out() {
        let err = fast()
            .supervise("DQBUF", || std::thread::sleep(Duration::from_millis(500)))
            .unwrap_err();
        assert!(matches!(err, AccelError::Timeout { request: "DQBUF", duration_ms: 60 }));
    }

    fn wait_idle(wd: &Watchdog, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while wd.idle_threads() < count {
            assert!(Instant::now() < deadline, "call thread never parked");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn consecutive_calls_share_one_thread() {
        let wd = fast();
        let first = wd.supervise("QBUF", || std::thread::current().id()).unwrap();
        wait_idle(&wd, 1);
        let second = wd.supervise("DQBUF", || std::thread::current().id()).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, std::thread::current().id());
    }

    #[test]
    fn hung_call_does_not_block_the_next() {
        let wd = fast();
        let hung = wd
            .supervise("QBUF", || {
                std::thread::sleep(Duration::from_millis(300));
                std::thread::current().id()
            })
            .unwrap_err();
        assert!(matches!(hung, AccelError::Timeout { request: "QBUF", .. }));

        let started = Instant::now();
        assert_eq!(wd.supervise("DQBUF", || 3).unwrap(), 3);
        assert!(started.elapsed() < Duration::from_millis(200));

        // Both threads park once the hung call returns
        wait_idle(&wd, 2);
    }

    #[test]
    fn zero_timeout_runs_inline() {
        let wd = Watchdog::new(Duration::ZERO, Duration::ZERO);
        let id = wd.supervise("S_PARAM", || std::thread::current().id()).unwrap();
        assert_eq!(id, std::thread::current().id());
    }
}
