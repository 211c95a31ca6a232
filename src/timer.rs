use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Summary of the recorded frame intervals
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStats {
    pub frames: usize,
    pub average_frame_time_ns: f64,
    /// standard deviation in nanoseconds
    pub jitter_ns: f64,
    pub min_frame_time_ns: f64,
    pub max_frame_time_ns: f64,
    pub effective_fps: f64,
}

/// Measures the wall-clock time between render ticks
#[derive(Debug, Clone)]
pub struct FrameClock {
    start: Instant,
    last_tick: Option<Instant>,
    frame_times: VecDeque<Duration>,
    max_samples: usize,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            start: Instant::now(),
            last_tick: None,
            frame_times: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    /// Returns seconds since the previous tick, 0 on the first one
    pub fn tick(&mut self) -> f64 {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> f64 {
        let delta = match self.last_tick.replace(now) {
            Some(previous) => now.saturating_duration_since(previous),
            None => return 0.0,
        };
        self.record_frame_time(delta);
        delta.as_secs_f64()
    }

    /// Time since the clock was created
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn record_frame_time(&mut self, duration: Duration) {
        if self.frame_times.len() >= self.max_samples {
            self.frame_times.pop_front();
        }
        self.frame_times.push_back(duration);
    }

    pub fn stats(&self) -> FrameStats {
        let frames = self.frame_times.len();
        if frames == 0 {
            return FrameStats {
                frames,
                average_frame_time_ns: 0.0,
                jitter_ns: 0.0,
                min_frame_time_ns: 0.0,
                max_frame_time_ns: 0.0,
                effective_fps: 0.0,
            };
        }
        let times_ns = self.frame_times.iter().map(|d| d.as_nanos() as f64);

        let avg = times_ns.clone().sum::<f64>() / frames as f64;
        let variance = times_ns.clone().map(|x| (x - avg).powi(2)).sum::<f64>() / frames as f64;
        let min = times_ns.clone().fold(f64::INFINITY, f64::min);
        let max = times_ns.fold(f64::NEG_INFINITY, f64::max);

        FrameStats {
            frames,
            average_frame_time_ns: avg,
            jitter_ns: variance.sqrt(),
            min_frame_time_ns: min,
            max_frame_time_ns: max,
            effective_fps: if avg > 0.0 { 1e9 / avg } else { 0.0 },
        }
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

/// High precision sleep (platform specific)
pub fn high_precision_sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    #[cfg(target_os = "windows")]
    windows_sleep(duration);
    #[cfg(target_os = "linux")]
    linux_sleep(duration);
    #[cfg(target_os = "macos")]
    macos_sleep(duration);
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    std::thread::sleep(duration);
}

#[cfg(target_os = "windows")]
fn windows_sleep(duration: Duration) {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{
        CreateWaitableTimerW, SetWaitableTimer, WaitForSingleObject, INFINITE,
    };

    // negative due time is relative, in 100 ns intervals
    let due_time = -((duration.as_nanos() / 100) as i64);

    unsafe {
        let Ok(timer) = CreateWaitableTimerW(None, true, PCWSTR::null()) else {
            std::thread::sleep(duration);
            return;
        };
        if SetWaitableTimer(timer, &due_time, 0, None, None, false).is_ok() {
            WaitForSingleObject(timer, INFINITE);
        } else {
            std::thread::sleep(duration);
        }
        let _ = CloseHandle(timer);
    }
}

#[cfg(target_os = "linux")]
fn linux_sleep(duration: Duration) {
    use libc::{clock_nanosleep, timespec, CLOCK_MONOTONIC, EINTR};

    let req = timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };
    let mut rem = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let mut next = req;

    // resume with the remainder when a signal interrupts the sleep
    while unsafe { clock_nanosleep(CLOCK_MONOTONIC, 0, &next, &mut rem) } == EINTR {
        next = rem;
    }
}

#[cfg(target_os = "macos")]
fn macos_sleep(duration: Duration) {
    use mach2::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t};

    if duration.as_nanos() >= 100_000 {
        std::thread::sleep(duration);
        return;
    }
    unsafe {
        let start = mach_absolute_time();
        let mut timebase = mach_timebase_info_data_t { numer: 0, denom: 0 };
        mach_timebase_info(&mut timebase);

        let target_ticks =
            duration.as_nanos() as u64 * timebase.denom as u64 / timebase.numer as u64;

        while mach_absolute_time() - start < target_ticks {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_is_zero() {
        let mut clock = FrameClock::new();
        assert_eq!(clock.tick(), 0.0);
        assert_eq!(clock.stats().frames, 0);
    }

    #[test]
    fn tick_reports_interval_since_previous() {
        let mut clock = FrameClock::new();
        let t0 = Instant::now();
        clock.tick_at(t0);
        let delta = clock.tick_at(t0 + Duration::from_millis(16));
        assert!((delta - 0.016).abs() < 1e-9);

        let delta = clock.tick_at(t0 + Duration::from_millis(50));
        assert!((delta - 0.034).abs() < 1e-9);
        assert_eq!(clock.stats().frames, 2);
    }

    #[test]
    fn stats_over_recorded_frames() {
        let mut clock = FrameClock::new();
        for ms in [10, 20, 30] {
            clock.record_frame_time(Duration::from_millis(ms));
        }
        let stats = clock.stats();
        assert_eq!(stats.average_frame_time_ns, 20e6);
        assert_eq!(stats.min_frame_time_ns, 10e6);
        assert_eq!(stats.max_frame_time_ns, 30e6);
        assert!((stats.effective_fps - 50.0).abs() < 1e-9);
        assert!((stats.jitter_ns - (200.0f64 / 3.0).sqrt() * 1e6).abs() < 1.0);
    }

    #[test]
    fn window_drops_oldest_samples() {
        let mut clock = FrameClock::with_capacity(2);
        for ms in [100, 10, 10] {
            clock.record_frame_time(Duration::from_millis(ms));
        }
        let stats = clock.stats();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.max_frame_time_ns, 10e6);
    }

    #[test]
    fn sleep_waits_at_least_the_duration() {
        let start = Instant::now();
        high_precision_sleep(Duration::from_millis(5));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
