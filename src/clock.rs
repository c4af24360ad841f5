//! TOD clock and timer service
//!
//! One independent task is the time source for the whole system. Every
//! `CLOCK_RESOLUTION` milliseconds it reads the wall clock, publishes a
//! new TOD value, decrements each CPU's timer and the interval timer
//! word in each PSA, recomputes the MIPS rates about once a second, and
//! wakes any waiting CPUs when a timer condition became pending.
//!
//! The TOD value is kept in the internal format: microseconds since the
//! 1900 epoch shifted left 4, so the epoch byte occupies bits 0-7 and
//! clock bits 0-51 occupy bits 8-59. The architectural register is this
//! value shifted left 8; clock comparators are compared in the internal
//! format, and the CPU timer decrement is the TOD difference shifted
//! left 8.
//!
//! CPU tasks read the published TOD without taking the parameter lock;
//! the value is a single 64-bit atomic, which is exactly the consistency
//! the architecture asks of an unserialized clock reference.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::info;

use crate::psa;
use crate::system::System;

/// Timer task resolution in milliseconds
pub const CLOCK_RESOLUTION: u64 = 10;

/// Interval-timer units removed per tick: the architecture decrements
/// bit position 26 at 300 Hz, which scales to 32 units per millisecond
pub const ITIMER_UNITS_PER_TICK: u32 = 32 * CLOCK_RESOLUTION as u32;

/// Seconds from the TOD epoch (1900-01-01) to the wall-clock epoch
/// (1970-01-01): 70 years of which 17 were leap years
pub const TOD_EPOCH_OFFSET_SECS: u64 = ((70 * 365) + 17) * 86_400;

/// Microseconds since the wall-clock epoch
pub fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64
}

struct TodParams {
    /// Drag factor (>= 1); virtual time advances at 1/drag wall speed
    drag: u64,
    /// Wall-clock origin the drag is measured from
    origin_us: Option<u64>,
}

/// The TOD clock: an atomically published value plus the mutexed
/// parameters the timer task uses to compute it.
pub struct TodClock {
    value: AtomicU64,
    params: Mutex<TodParams>,
}

impl TodClock {
    /// Create a TOD clock with the given drag factor
    pub fn new(drag: u64) -> Self {
        Self {
            value: AtomicU64::new(0),
            params: Mutex::new(TodParams {
                drag,
                origin_us: None,
            }),
        }
    }

    /// Current TOD value in the internal format (0 until the first tick)
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Publish the TOD value for the given wall-clock time and return
    /// the difference from the previous value.
    ///
    /// The published value never decreases: a wall clock that steps
    /// backwards yields a zero difference, keeping the TOD monotonic
    /// for every observer.
    pub fn advance_to(&self, wall_us: u64) -> u64 {
        let mut params = self.params.lock().unwrap();
        let dragged = if params.drag > 1 {
            let origin = *params.origin_us.get_or_insert(wall_us);
            origin + wall_us.saturating_sub(origin) / params.drag
        } else {
            wall_us
        };

        // Epoch byte in bits 0-7, clock bits 0-51 in bits 8-59
        let mut dreg = (dragged + TOD_EPOCH_OFFSET_SECS * 1_000_000) << 4;

        let prev = self.value.load(Ordering::Relaxed);
        if dreg < prev {
            dreg = prev;
        }
        let diff = if prev == 0 { 0 } else { dreg - prev };
        self.value.store(dreg, Ordering::Relaxed);
        drop(params);
        diff
    }
}

/// State carried by the timer task between ticks
pub struct TimerTicker {
    /// Milliseconds accumulated toward the next MIPS sample
    msecctr: u64,
}

impl TimerTicker {
    /// Create the tick state
    pub fn new() -> Self {
        Self { msecctr: 0 }
    }

    /// Run one timer-task iteration against the wall clock
    pub fn tick(&mut self, sys: &System) {
        self.tick_at(sys, wall_clock_us());
    }

    /// Run one timer-task iteration at an explicit wall-clock time
    /// (microseconds since 1970). Separated from [`tick`](Self::tick)
    /// so tests can drive time deterministically.
    pub fn tick_at(&mut self, sys: &System, wall_us: u64) {
        let diff = sys.tod.advance_to(wall_us);

        // Shift the epoch byte out of the difference for the CPU timer
        let timer_diff = diff << 8;
        let tod_now = sys.tod.value();
        let mut intflag = false;

        for (ad, cpu) in sys.cpus.iter().enumerate() {
            let mut regs = cpu.lock().unwrap();

            regs.ptimer = regs.ptimer.wrapping_sub(timer_diff);

            // Clock comparator and CPU timer are level conditions: they
            // wake waiting CPUs but set no latch; the dispatcher
            // re-evaluates them against CR0.
            if (regs.ptimer as i64) < 0 || tod_now > regs.clkc {
                intflag = true;
            }

            // Decrement the interval timer word in this CPU's PSA in one
            // locked operation, and latch the interrupt exactly once
            // when the value crosses from non-negative to negative.
            if let Ok((old, new)) = sys.storage.update_fullword(
                regs.pxr + psa::INT_TIMER,
                |v| v.wrapping_sub(ITIMER_UNITS_PER_TICK),
            ) {
                if (new as i32) < 0 && (old as i32) >= 0 {
                    let mut ints = sys.ints.lock().unwrap();
                    let pend = &mut ints.cpu[ad];
                    pend.itimer_pending = true;
                    pend.update_cpuint();
                    drop(ints);
                    intflag = true;
                }
            }
        }

        // Recompute the MIPS rates about once a second; the counter is
        // reset only when it crosses the window
        self.msecctr += CLOCK_RESOLUTION;
        if self.msecctr > 999 {
            for cpu in &sys.cpus {
                let mut regs = cpu.lock().unwrap();
                regs.mipsrate = (regs.instcount - regs.prevcount) / self.msecctr;
                regs.prevcount = regs.instcount;
            }
            self.msecctr = 0;
        }

        let mut ints = sys.ints.lock().unwrap();
        let attn = sys.drain_attention(&mut ints);
        if intflag || attn {
            sys.intcond.notify_all();
        }
        drop(ints);
    }
}

impl Default for TimerTicker {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the timer task. It runs for the life of the process; no
/// graceful shutdown is required of it.
pub fn spawn_timer_thread(sys: Arc<System>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("timer".into()).spawn(move || {
        info!("timer thread started");
        let mut ticker = TimerTicker::new();
        loop {
            ticker.tick(&sys);
            thread::sleep(Duration::from_millis(CLOCK_RESOLUTION));
        }
    })
}
