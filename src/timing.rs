//! TSC-based timing.
//!
//! The event loop and the management retry sweep measure time with the
//! timestamp counter, converted through the CPU frequency the registry
//! measures once at startup.

/// Read the timestamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::time::Instant;
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Measure the TSC frequency in GHz by spinning against the monotonic
/// clock for a few milliseconds. Done once per process, at registry
/// construction.
pub fn measure_freq_ghz() -> f64 {
    use std::time::{Duration, Instant};

    let start = Instant::now();
    let start_tsc = rdtsc();
    while start.elapsed() < Duration::from_millis(10) {
        std::hint::spin_loop();
    }
    let cycles = rdtsc().wrapping_sub(start_tsc);
    let nanos = start.elapsed().as_nanos() as u64;
    cycles as f64 / nanos as f64
}

/// Convert a cycle count to milliseconds.
#[inline]
pub fn to_ms(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1_000_000.0)
}

/// Convert a cycle count to seconds.
#[inline]
pub fn to_sec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1_000_000_000.0)
}

/// Convert milliseconds to a cycle count.
#[inline]
pub fn ms_to_cycles(ms: u64, freq_ghz: f64) -> u64 {
    (ms as f64 * freq_ghz * 1_000_000.0) as u64
}
