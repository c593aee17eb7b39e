#[cfg(test)]
#[macro_use]
extern crate approx;
use bincode::{Decode, Encode};
use portable_atomic::{AtomicU32, AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced by clock configuration and the short-delay fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    /// The auto-reload value was zero, which would make every raw read a wrap.
    ZeroReload,
    /// The counter frequency was zero, which no conversion can work with.
    ZeroFrequency,
    /// The request does not meet the preconditions of the short-delay path.
    UnsupportedShortDelay,
}

impl Display for ClockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockError::ZeroReload => write!(f, "clock reload value must be non-zero"),
            ClockError::ZeroFrequency => write!(f, "clock frequency must be non-zero"),
            ClockError::UnsupportedShortDelay => {
                write!(f, "request is not supported by the short-delay path")
            }
        }
    }
}

impl Error for ClockError {}

// Generic Result type for the clock.
pub type ClockResult<T> = Result<T, ClockError>;

/// Static description of the underlying counter: its auto-reload value, its
/// frequency and the conversion coefficients precomputed from them.
///
/// A config is immutable once built. Reconfiguring a running system means
/// building a new [`TickClock`]; handles created against the old clock must
/// not be reused against the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ClockConfig {
    reload: u32,
    freq_hz: u32,
    us_exact: bool,
    us_per_tick: u32,
    ns_exact: bool,
    ns_per_tick: u32,
    overflows_per_ms: u32,
}

impl ClockConfig {
    /// Validates the counter parameters and precomputes the conversion
    /// coefficients.
    ///
    /// `reload` is the value at which the raw counter wraps back to zero, so
    /// raw reads live in `[0, reload)`. `freq_hz` is the tick rate of the
    /// counter. Both must be non-zero.
    pub fn new(reload: u32, freq_hz: u32) -> ClockResult<Self> {
        if reload == 0 {
            return Err(ClockError::ZeroReload);
        }
        if freq_hz == 0 {
            return Err(ClockError::ZeroFrequency);
        }
        let us_exact = freq_hz % 1_000_000 == 0;
        // Kept unconditionally, only read on the exact path.
        let us_per_tick = freq_hz / 1_000_000;
        let ns_exact = freq_hz % 1_000_000_000 == 0;
        let ns_per_tick = if ns_exact { freq_hz / 1_000_000_000 } else { 0 };
        let overflows_per_ms = freq_hz / reload / 1000;
        Ok(ClockConfig {
            reload,
            freq_hz,
            us_exact,
            us_per_tick,
            ns_exact,
            ns_per_tick,
            overflows_per_ms,
        })
    }

    /// The value at which the raw counter wraps back to zero.
    pub fn reload(&self) -> u32 {
        self.reload
    }

    /// The tick rate of the counter in Hz.
    pub fn frequency_hz(&self) -> u32 {
        self.freq_hz
    }

    /// True when one microsecond is a whole number of ticks.
    pub fn us_exact(&self) -> bool {
        self.us_exact
    }

    /// True when one nanosecond is a whole number of ticks.
    pub fn ns_exact(&self) -> bool {
        self.ns_exact
    }

    /// How many times the counter wraps per millisecond (rounded down).
    pub fn overflows_per_ms(&self) -> u32 {
        self.overflows_per_ms
    }

    /// Converts a tick count to microseconds, truncating toward zero.
    ///
    /// When the frequency divides evenly into microseconds this is a single
    /// exact division with no rounding error; otherwise the value is scaled
    /// through a wide intermediate.
    pub fn ticks_to_us(&self, ticks: u64) -> u64 {
        if self.us_exact {
            ticks / u64::from(self.us_per_tick)
        } else {
            (u128::from(ticks) * 1_000_000 / u128::from(self.freq_hz)) as u64
        }
    }

    /// Converts a tick count to nanoseconds, truncating toward zero.
    ///
    /// The scaled path multiplies by 1e9 before dividing, which overflows
    /// u64 for large deltas, so it is computed in u128.
    pub fn ticks_to_ns(&self, ticks: u64) -> u64 {
        if self.ns_exact {
            ticks / u64::from(self.ns_per_tick)
        } else {
            (u128::from(ticks) * 1_000_000_000 / u128::from(self.freq_hz)) as u64
        }
    }

    /// Converts a tick count to seconds in single precision.
    ///
    /// f32 carries about 7 significant digits, so this loses accuracy after
    /// a few hours of uptime. Use [`ClockConfig::ticks_to_secs_f64`] or the
    /// integer microsecond conversions when long horizons matter.
    pub fn ticks_to_secs_f32(&self, ticks: u64) -> f32 {
        self.ticks_to_us(ticks) as f32 * 1e-6
    }

    /// Converts a tick count to seconds in double precision.
    pub fn ticks_to_secs_f64(&self, ticks: u64) -> f64 {
        self.ticks_to_ns(ticks) as f64 * 1e-9
    }

    /// Converts a microsecond duration to the equivalent tick count.
    pub fn us_to_ticks(&self, us: u32) -> u64 {
        if self.us_exact {
            u64::from(us) * u64::from(self.us_per_tick)
        } else {
            u64::from(us) * u64::from(self.freq_hz) / 1_000_000
        }
    }

    /// Converts a nanosecond duration to the equivalent tick count,
    /// truncating toward zero.
    pub fn ns_to_ticks(&self, ns: u32) -> u64 {
        u64::from(ns) * u64::from(self.freq_hz) / 1_000_000_000
    }

    /// Ticks elapsed between two consistent samples, accounting for wraps.
    ///
    /// When the raw count regressed, exactly one of the counted wraps is
    /// already explained by the regression itself and the remaining wraps
    /// each contribute a full reload period. The overflow difference uses
    /// wrapping arithmetic so the count staying correct does not depend on
    /// the overflow counter never rolling over.
    pub fn ticks_between(&self, base: Sample, current: Sample) -> u64 {
        let reload = u64::from(self.reload);
        if current.raw >= base.raw {
            let wraps = u64::from(current.overflows.wrapping_sub(base.overflows));
            wraps * reload + u64::from(current.raw - base.raw)
        } else {
            let wraps = u64::from(current.overflows.wrapping_sub(base.overflows).wrapping_sub(1));
            wraps * reload + u64::from(self.reload - base.raw) + u64::from(current.raw)
        }
    }
}

/// One consistent observation of the counter: the raw count and the number
/// of wraps at the same instant. Only produced by [`TickClock::sample`],
/// which guarantees the pair is never torn across a wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Sample {
    /// Raw counter value in `[0, reload)`.
    pub raw: u32,
    /// Wrap events observed so far.
    pub overflows: u32,
}

/// Monotonic count of counter wrap events.
///
/// It is clone resilient, ie a clone is the same counter: hand one clone to
/// the overflow interrupt and keep another in the clock, both observe the
/// same count. The u32 itself rolling over is accepted for realistic
/// uptimes; delta arithmetic tolerates it.
#[derive(Debug, Clone, Default)]
pub struct OverflowCounter(Arc<AtomicU32>);

impl OverflowCounter {
    pub fn new() -> Self {
        OverflowCounter(Arc::new(AtomicU32::new(0)))
    }

    /// Records one wrap event.
    ///
    /// Call exactly once per hardware overflow, from the overflow interrupt.
    /// The release store pairs with the acquire loads in [`TickClock::sample`].
    #[inline]
    pub fn notify(&self) {
        let Self(count) = self;
        count.fetch_add(1, Ordering::Release);
    }

    /// The number of wraps recorded so far.
    #[inline]
    pub fn count(&self) -> u32 {
        let Self(count) = self;
        count.load(Ordering::Acquire)
    }

    fn reset(&self) {
        let Self(count) = self;
        count.store(0, Ordering::Release);
    }
}

/// Read access to the free-running hardware count, in `[0, reload)`.
///
/// This is the only collaborator the clock needs from the outside. The clock
/// never owns, configures or resets the counter; binding a real timer
/// peripheral and registering its overflow interrupt stay with the caller.
pub trait CounterSource {
    fn read_raw(&self) -> u32;
}

/// Adapts a closure over a register read into a [`CounterSource`].
#[derive(Clone)]
pub struct CounterFn<F>(pub F);

impl<F> CounterSource for CounterFn<F>
where
    F: Fn() -> u32,
{
    #[inline]
    fn read_raw(&self) -> u32 {
        let Self(read) = self;
        read()
    }
}

/// A caller-owned interval baseline.
///
/// Every elapsed query replaces the baseline with the sample it just took,
/// so each call measures the interval since the previous call, not since
/// [`TickClock::init_handle`]. Handles are purely local: independent handles
/// measuring overlapping intervals never interfere.
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct IntervalHandle {
    baseline: Sample,
}

/// A monotonic clock over a wrapping hardware counter.
///
/// The clock derives its time base from two inputs: the injected raw counter
/// read and the overflow notifications delivered through a clone of its
/// [`OverflowCounter`]. It is clone resilient when the source is: clones
/// share the same overflow count and therefore the same timeline.
#[derive(Debug, Clone)]
pub struct TickClock<C: CounterSource> {
    counter: C,
    config: ClockConfig,
    overflows: OverflowCounter,
}

impl<C: CounterSource> TickClock<C> {
    /// Creates a clock over the given counter source with a fresh overflow
    /// count of zero.
    pub fn new(counter: C, config: ClockConfig) -> Self {
        TickClock {
            counter,
            config,
            overflows: OverflowCounter::new(),
        }
    }

    /// Validates the counter parameters and creates a clock in one step.
    pub fn try_new(counter: C, reload: u32, freq_hz: u32) -> ClockResult<Self> {
        Ok(Self::new(counter, ClockConfig::new(reload, freq_hz)?))
    }

    /// Creates a clock around an overflow counter that already exists, for
    /// targets where the interrupt handler has to be wired up before the
    /// clock can be built. The count is reset to zero.
    pub fn with_overflow_counter(
        counter: C,
        config: ClockConfig,
        overflows: OverflowCounter,
    ) -> Self {
        overflows.reset();
        TickClock {
            counter,
            config,
            overflows,
        }
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// A clone of the overflow counter, meant to be captured by the overflow
    /// interrupt handler. One [`OverflowCounter::notify`] per wrap is the
    /// contract the rest of the clock is built on.
    pub fn overflow_counter(&self) -> OverflowCounter {
        self.overflows.clone()
    }

    /// Takes one consistent `(raw, overflows)` snapshot.
    ///
    /// The overflow count is read before and after the raw counter; a
    /// mismatch means a wrap slid in between and the read is retried, so the
    /// returned pair always reflects a single instant. The retry loop is
    /// unbounded in theory; in practice it terminates because a wrap takes
    /// far longer than a counter read. That is an assumption about the
    /// configured hardware, not something this code can enforce.
    #[inline]
    pub fn sample(&self) -> Sample {
        loop {
            let overflows = self.overflows.count();
            let raw = self.counter.read_raw();
            if self.overflows.count() == overflows {
                return Sample { raw, overflows };
            }
        }
    }

    /// Creates a handle whose baseline is the current instant.
    pub fn init_handle(&self) -> IntervalHandle {
        IntervalHandle {
            baseline: self.sample(),
        }
    }

    /// Ticks elapsed since the handle's previous query (or its creation),
    /// advancing the baseline to now.
    ///
    /// Correct accounting requires the overflow notification to have fired
    /// exactly once per wrap, and to be visible here before the raw counter
    /// can be observed past that wrap. The hardware binding provides that
    /// ordering. If interrupts are starved long enough to swallow a wrap
    /// entirely, the delta silently under-counts by one reload period; the
    /// clock assumes bounded interrupt latency rather than guessing.
    pub fn elapsed_ticks(&self, handle: &mut IntervalHandle) -> u64 {
        let current = self.sample();
        let ticks = self.config.ticks_between(handle.baseline, current);
        handle.baseline = current;
        ticks
    }

    /// Microseconds elapsed since the handle's previous query.
    ///
    /// The return width bounds the measurable interval to about 71 minutes;
    /// the internal arithmetic is wide and the excess is truncated.
    pub fn elapsed_us(&self, handle: &mut IntervalHandle) -> u32 {
        self.config.ticks_to_us(self.elapsed_ticks(handle)) as u32
    }

    /// Nanoseconds elapsed since the handle's previous query.
    ///
    /// The return width bounds the measurable interval to about 4.3 seconds;
    /// the internal arithmetic is wide and the excess is truncated.
    pub fn elapsed_ns(&self, handle: &mut IntervalHandle) -> u32 {
        self.config.ticks_to_ns(self.elapsed_ticks(handle)) as u32
    }

    /// Seconds elapsed since the handle's previous query, single precision.
    /// See [`ClockConfig::ticks_to_secs_f32`] for the accuracy caveat.
    pub fn elapsed_secs_f32(&self, handle: &mut IntervalHandle) -> f32 {
        self.config.ticks_to_secs_f32(self.elapsed_ticks(handle))
    }

    /// Seconds elapsed since the handle's previous query, double precision.
    pub fn elapsed_secs_f64(&self, handle: &mut IntervalHandle) -> f64 {
        self.config.ticks_to_secs_f64(self.elapsed_ticks(handle))
    }

    /// Bridge to standard durations for the interval queries.
    pub fn elapsed(&self, handle: &mut IntervalHandle) -> Duration {
        Duration::from_nanos(self.config.ticks_to_ns(self.elapsed_ticks(handle)))
    }

    /// Cumulative ticks since the clock was created.
    ///
    /// Unlike the interval queries this does not reset anything; it only
    /// wraps when the u64 itself overflows, which realistic configurations
    /// do not reach.
    pub fn timestamp_ticks(&self) -> u64 {
        let Sample { raw, overflows } = self.sample();
        u64::from(overflows) * u64::from(self.config.reload) + u64::from(raw)
    }

    /// Microseconds since the clock was created.
    pub fn timestamp_us(&self) -> u64 {
        self.config.ticks_to_us(self.timestamp_ticks())
    }

    /// Seconds since the clock was created, single precision.
    /// See [`ClockConfig::ticks_to_secs_f32`] for the accuracy caveat.
    pub fn timestamp_secs_f32(&self) -> f32 {
        self.config.ticks_to_secs_f32(self.timestamp_ticks())
    }

    /// Seconds since the clock was created, double precision.
    pub fn timestamp_secs_f64(&self) -> f64 {
        self.config.ticks_to_secs_f64(self.timestamp_ticks())
    }

    /// Bridge to standard durations for the absolute timestamp.
    pub fn timestamp(&self) -> Duration {
        Duration::from_nanos(self.config.ticks_to_ns(self.timestamp_ticks()))
    }

    /// Spins until at least `target_ticks` have elapsed.
    ///
    /// The wait is a pure polling loop pinned to a local baseline: whether a
    /// wrap happened since the start is recomputed from each fresh sample,
    /// never stored. The call blocks the calling context for the whole wait;
    /// there is no cancellation and no yielding.
    pub fn delay_spin_ticks(&self, target_ticks: u64) {
        let baseline = self.sample();
        loop {
            let current = self.sample();
            if self.config.ticks_between(baseline, current) >= target_ticks {
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Busy-waits for at least `us` microseconds.
    pub fn delay_us(&self, us: u32) {
        self.delay_spin_ticks(self.config.us_to_ticks(us));
    }

    /// Busy-waits for at least `ns` nanoseconds, rounded down to whole ticks.
    pub fn delay_ns(&self, ns: u32) {
        self.delay_spin_ticks(self.config.ns_to_ticks(ns));
    }

    /// Busy-waits for at least the given duration, rounded down to whole
    /// ticks.
    pub fn delay(&self, duration: Duration) {
        let ticks = duration.as_nanos() * u128::from(self.config.freq_hz) / 1_000_000_000;
        self.delay_spin_ticks(ticks as u64);
    }

    /// Variant of [`TickClock::delay_us`] whose target tick count is bounded
    /// to u32. Requests beyond that width are truncated; at 84 MHz the limit
    /// sits around 51 seconds.
    pub fn delay_us_32(&self, us: u32) {
        self.delay_spin_ticks(u64::from(self.config.us_to_ticks(us) as u32));
    }

    /// Short microsecond busy-wait on a simplified single-wrap computation.
    ///
    /// Only supported when the microsecond conversion is exact, `us` is
    /// under a millisecond and the counter wraps at most once per
    /// millisecond, so that at most one wrap can occur during the wait. Any
    /// other request returns [`ClockError::UnsupportedShortDelay`] before
    /// sampling or waiting at all; the simplified accounting is never run
    /// outside its assumptions.
    pub fn delay_short_us(&self, us: u32) -> ClockResult<()> {
        if !(self.config.us_exact && us < 1000 && self.config.overflows_per_ms <= 1) {
            return Err(ClockError::UnsupportedShortDelay);
        }
        let target = us * self.config.us_per_tick;
        let start = self.sample();
        loop {
            let current = self.sample();
            let elapsed = if current.overflows == start.overflows {
                current.raw.wrapping_sub(start.raw)
            } else {
                // At most one wrap by precondition.
                (self.config.reload - start.raw).wrapping_add(current.raw)
            };
            if elapsed >= target {
                return Ok(());
            }
            core::hint::spin_loop();
        }
    }
}

impl TickClock<MockCounter> {
    /// Builds a clock over a simulated counter with a reference time of 0.
    /// The [`MockCounter`] handle controls the virtual timeline of the clock
    /// and all its clones.
    pub fn mock(reload: u32, freq_hz: u32) -> ClockResult<(Self, MockCounter)> {
        let config = ClockConfig::new(reload, freq_hz)?;
        let overflows = OverflowCounter::new();
        let mock = MockCounter::new(reload, overflows.clone());
        Ok((
            TickClock {
                counter: mock.clone(),
                config,
                overflows,
            },
            mock,
        ))
    }
}

/// A deterministic counter that can be controlled by the test.
///
/// It keeps an absolute virtual tick timeline; reads expose it modulo the
/// reload value and every wrap crossed by [`MockCounter::advance`] fires the
/// paired overflow counter, mimicking the interrupt the hardware would
/// deliver. It is a single-threaded driver: advancing it concurrently with
/// samplers on another thread is outside its contract.
#[derive(Debug, Clone)]
pub struct MockCounter(Arc<MockState>);

#[derive(Debug)]
struct MockState {
    reload: u32,
    ticks: AtomicU64,
    step: AtomicU64,
    overflows: OverflowCounter,
}

impl MockCounter {
    fn new(reload: u32, overflows: OverflowCounter) -> Self {
        MockCounter(Arc::new(MockState {
            reload,
            ticks: AtomicU64::new(0),
            step: AtomicU64::new(0),
            overflows,
        }))
    }

    /// Moves the virtual timeline forward, firing one overflow notification
    /// per wrap boundary crossed.
    pub fn advance(&self, ticks: u64) {
        let Self(state) = self;
        let reload = u64::from(state.reload);
        let before = state.ticks.fetch_add(ticks, Ordering::AcqRel);
        let after = before + ticks;
        for _ in 0..(after / reload - before / reload) {
            state.overflows.notify();
        }
    }

    /// Makes every raw read advance the timeline by `ticks` first, so spin
    /// loops progress without a second thread. Keep the step below the
    /// reload value, otherwise every read crosses a wrap and sampling can
    /// never observe a stable pair. Zero turns auto-stepping off.
    pub fn auto_step(&self, ticks: u64) {
        let Self(state) = self;
        state.step.store(ticks, Ordering::Relaxed);
    }

    /// Absolute virtual ticks since the mock was created.
    pub fn now_ticks(&self) -> u64 {
        let Self(state) = self;
        state.ticks.load(Ordering::Acquire)
    }
}

impl CounterSource for MockCounter {
    fn read_raw(&self) -> u32 {
        let Self(state) = self;
        let step = state.step.load(Ordering::Relaxed);
        if step > 0 {
            self.advance(step);
        }
        (state.ticks.load(Ordering::Acquire) % u64::from(state.reload)) as u32
    }
}
