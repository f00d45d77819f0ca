//! Monotonic time for transfer timeouts

/// A free-running, wrapping tick counter
///
/// Elapsed time is computed with wrapping subtraction, so a clock only
/// needs to be monotonic modulo 2^32 ticks.
pub trait Clock {
    /// The current tick count
    fn ticks(&self) -> u32;
    /// How many ticks elapse per microsecond. Never zero.
    fn ticks_per_microsecond(&self) -> u32;

    /// Microseconds elapsed since `start`, a previous [`ticks()`](Clock::ticks) value
    fn microseconds_since(&self, start: u32) -> u32 {
        self.ticks().wrapping_sub(start) / self.ticks_per_microsecond().max(1)
    }
}

/// A [`Clock`] backed by the Cortex-M DWT cycle counter
///
/// At 204 MHz, the counter wraps every 21 seconds, which is plenty for
/// transfer timeouts.
pub struct DwtClock {
    cycles_per_microsecond: u32,
}

impl DwtClock {
    /// Enable the cycle counter, and describe the core clock frequency
    ///
    /// Takes the debug peripherals to prove that nobody else is
    /// reconfiguring the counter.
    pub fn new(
        dcb: &mut cortex_m::peripheral::DCB,
        dwt: &mut cortex_m::peripheral::DWT,
        core_hz: u32,
    ) -> Self {
        dcb.enable_trace();
        dwt.enable_cycle_counter();
        DwtClock {
            cycles_per_microsecond: (core_hz / 1_000_000).max(1),
        }
    }
}

impl Clock for DwtClock {
    fn ticks(&self) -> u32 {
        cortex_m::peripheral::DWT::cycle_count()
    }
    fn ticks_per_microsecond(&self) -> u32 {
        self.cycles_per_microsecond
    }
}
