//! Monotonic one-shot timer (spec §5 "Suspension points").
//!
//! The scheduler's only blocking primitive is a `CLOCK_MONOTONIC` one-shot
//! arm: no device interrupts, no sleeps on the device itself. `timerfd` is
//! used for the real backend so the timer composes with whatever poll loop
//! the host's main event loop runs (spec §1, the host "supplies ... a main
//! event loop"); a `MockTimer` stands in for tests per spec §9's call for a
//! trait-modeled collaborator.

use crate::error::{EngineError, Result};
use std::os::unix::io::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of the monotonic clock, in nanoseconds. Split out from the
/// timer itself so ticks can be driven by a fake clock in tests without a
/// real timerfd in the loop.
pub trait MonotonicClock {
    fn now_ns(&self) -> u64;
}

/// `CLOCK_MONOTONIC` via `clock_gettime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl MonotonicClock for SystemClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// One-shot absolute-deadline timer (spec §4.4 "absolute-deadline
/// (CLOCK_MONOTONIC) one-shot arming").
pub trait OneShotTimer {
    /// Arm the timer to fire once at `deadline_ns` (absolute, same clock as
    /// [`MonotonicClock::now_ns`]).
    fn arm_absolute(&mut self, deadline_ns: u64) -> Result<()>;

    /// Disarm (spec §5 "Cancellation": pause disarms the timer).
    fn disarm(&mut self) -> Result<()>;
}

/// `timerfd_create(CLOCK_MONOTONIC, ...)` wrapper, in the style of
/// `diwic-alsa-rs`'s thin syscall wrappers (`check`-and-wrap every call).
#[derive(Debug)]
pub struct TimerFd(RawFd);

impl TimerFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
        if fd < 0 {
            return Err(EngineError::device("timerfd_create", fd, "failed to create timer"));
        }
        Ok(TimerFd(fd))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl OneShotTimer for TimerFd {
    fn arm_absolute(&mut self, deadline_ns: u64) -> Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: (deadline_ns / 1_000_000_000) as libc::time_t,
                tv_nsec: (deadline_ns % 1_000_000_000) as libc::c_long,
            },
        };
        let r = unsafe { libc::timerfd_settime(self.0, libc::TFD_TIMER_ABSTIME, &spec, std::ptr::null_mut()) };
        if r < 0 {
            return Err(EngineError::device("timerfd_settime", r, "failed to arm timer"));
        }
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        };
        let r = unsafe { libc::timerfd_settime(self.0, 0, &spec, std::ptr::null_mut()) };
        if r < 0 {
            return Err(EngineError::device("timerfd_settime", r, "failed to disarm timer"));
        }
        Ok(())
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// A controllable clock + timer pair for tests: `now_ns` is set explicitly
/// by the test driver rather than reading the real clock.
#[derive(Debug, Default)]
pub struct MockTimer {
    pub now: u64,
    pub armed_at: Option<u64>,
}

impl MockTimer {
    pub fn new(start_ns: u64) -> Self {
        MockTimer { now: start_ns, armed_at: None }
    }

    pub fn advance_to(&mut self, ns: u64) {
        self.now = ns;
    }
}

impl MonotonicClock for MockTimer {
    fn now_ns(&self) -> u64 {
        self.now
    }
}

impl OneShotTimer for MockTimer {
    fn arm_absolute(&mut self, deadline_ns: u64) -> Result<()> {
        self.armed_at = Some(deadline_ns);
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        self.armed_at = None;
        Ok(())
    }
}

/// Bundles [`SystemClock`] and [`TimerFd`] behind the one type
/// [`crate::scheduler::Engine`] is generic over, since a real engine needs
/// both traits from one owned value.
#[derive(Debug)]
pub struct RealTimer {
    clock: SystemClock,
    timer: TimerFd,
}

impl RealTimer {
    pub fn new() -> Result<Self> {
        Ok(RealTimer { clock: SystemClock, timer: TimerFd::new()? })
    }
}

impl MonotonicClock for RealTimer {
    fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }
}

impl OneShotTimer for RealTimer {
    fn arm_absolute(&mut self, deadline_ns: u64) -> Result<()> {
        self.timer.arm_absolute(deadline_ns)
    }

    fn disarm(&mut self) -> Result<()> {
        self.timer.disarm()
    }
}

/// Wall-clock nanoseconds since `UNIX_EPOCH`, used only for buffer header
/// presentation timestamps (spec §4.5.3 "pts = wall_clock") - not the
/// monotonic clock the scheduler paces off of.
pub fn wall_clock_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}
