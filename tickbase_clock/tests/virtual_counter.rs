mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tickbase_clock::{ClockConfig, CounterFn, TickClock};

    /// Drives the public API the way a hardware binding would: a closure
    /// over a "register" for the raw count, and the overflow counter clone
    /// standing in for the update interrupt.
    #[test]
    fn test_register_backed_clock_end_to_end() {
        let register = Arc::new(AtomicU32::new(0));
        let source = CounterFn({
            let register = register.clone();
            move || register.load(Ordering::Relaxed)
        });
        let clock = TickClock::new(source, ClockConfig::new(8_000, 8_000_000).unwrap());
        let irq = clock.overflow_counter();

        let mut handle = clock.init_handle();
        register.store(4_000, Ordering::Relaxed);
        assert_eq!(clock.elapsed_ticks(&mut handle), 4_000);

        // The counter wraps: the interrupt fires once, the count regresses.
        register.store(3, Ordering::Relaxed);
        irq.notify();
        assert_eq!(clock.elapsed_ticks(&mut handle), 4_003);

        assert_eq!(clock.timestamp_ticks(), 8_003);
        assert_eq!(clock.timestamp_us(), 1_000);
    }

    #[test]
    fn test_delay_against_self_advancing_register() {
        // A counter that advances one tick per read, far from any wrap.
        let register = Arc::new(AtomicU32::new(0));
        let source = CounterFn({
            let register = register.clone();
            move || register.fetch_add(1, Ordering::Relaxed)
        });
        let clock = TickClock::try_new(source, 1_000_000, 8_000_000).unwrap();

        clock.delay_us(5); // 40 ticks at 8 MHz
        assert!(register.load(Ordering::Relaxed) >= 40);

        let before = register.load(Ordering::Relaxed);
        clock.delay_ns(1_000); // 8 ticks
        assert!(register.load(Ordering::Relaxed) - before >= 8);
    }
}
