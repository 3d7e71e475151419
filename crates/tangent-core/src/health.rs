//! Non-realtime watchdog over the realtime path
//!
//! Runs at 10 Hz in the supervisory context, reading the latency ring,
//! xrun counter, bus drop counter and per-device error telemetry. It never
//! touches the audio thread directly: recovery goes through the shared
//! panic flag, the buffer-doubling request, and supervisor commands.
//!
//! Transient trouble stays in telemetry and the log — the performer only
//! ever hears about fatal conditions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bus::{DropCounter, Telemetry, TelemetryEvent};
use crate::input::SupervisorCommand;
use crate::render::AudioShared;
use crate::types::DeviceId;

/// Probe period (10 Hz)
pub const PROBE_PERIOD: Duration = Duration::from_millis(100);

/// Reopen a device's reader past this many errors per minute
const DEVICE_ERROR_LIMIT: usize = 10;
const DEVICE_ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Warn about bus drops past this rate, sustained over consecutive seconds
const DROP_RATE_LIMIT: f64 = 100.0;
const DROP_SUSTAIN_SECONDS: u32 = 2;

/// Largest buffer the doubling request will ask for
const MAX_REQUEST_FRAMES: u32 = 8_192;

/// Latency statistics computed from the render-call ring
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyStats {
    pub avg_ns: u64,
    pub p95_ns: u64,
    pub samples: usize,
}

/// Compute avg and p95 of a latency snapshot.
pub fn latency_stats(mut samples: Vec<u64>) -> LatencyStats {
    if samples.is_empty() {
        return LatencyStats::default();
    }
    samples.sort_unstable();
    let sum: u64 = samples.iter().sum();
    let p95_idx = (samples.len() * 95) / 100;
    LatencyStats {
        avg_ns: sum / samples.len() as u64,
        p95_ns: samples[p95_idx.min(samples.len() - 1)],
        samples: samples.len(),
    }
}

pub struct HealthProbe {
    shared: Arc<AudioShared>,
    drops: DropCounter,
    telemetry: Telemetry,
    events: flume::Receiver<TelemetryEvent>,
    supervisor: flume::Sender<SupervisorCommand>,

    last_xruns: u64,
    latency_over_budget: bool,
    device_errors: HashMap<DeviceId, VecDeque<Instant>>,
    last_drop_count: u64,
    last_drop_check: Option<Instant>,
    high_drop_seconds: u32,
    drop_warned: bool,
}

impl HealthProbe {
    pub fn new(
        shared: Arc<AudioShared>,
        drops: DropCounter,
        telemetry: Telemetry,
        supervisor: flume::Sender<SupervisorCommand>,
    ) -> Self {
        let events = telemetry.subscribe();
        Self {
            shared,
            drops,
            telemetry,
            events,
            supervisor,
            last_xruns: 0,
            latency_over_budget: false,
            device_errors: HashMap::new(),
            last_drop_count: 0,
            last_drop_check: None,
            high_drop_seconds: 0,
            drop_warned: false,
        }
    }

    /// 10 Hz loop until shutdown.
    pub fn run(mut self, running: Arc<std::sync::atomic::AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            self.tick(Instant::now());
            std::thread::sleep(PROBE_PERIOD);
        }
    }

    /// One probe pass. Split out so tests can drive time explicitly.
    pub fn tick(&mut self, now: Instant) {
        self.check_renderer();
        self.check_devices(now);
        self.check_drops(now);
    }

    fn check_renderer(&mut self) {
        let budget = self.shared.buffer_period_ns.load(Ordering::Relaxed);
        if budget == 0 {
            return;
        }

        let stats = latency_stats(self.shared.latency.snapshot());
        let xruns = self.shared.xruns.load(Ordering::Relaxed);
        let xrun_hit = xruns > self.last_xruns;
        self.last_xruns = xruns;

        let over_budget = stats.samples > 0 && stats.p95_ns > budget;
        // Act on the transition, not on every tick of a bad stretch
        let newly_over = over_budget && !self.latency_over_budget;
        self.latency_over_budget = over_budget;

        if xrun_hit || newly_over {
            let current = self.shared.buffer_frames.load(Ordering::Relaxed);
            let doubled = (current * 2).clamp(current, MAX_REQUEST_FRAMES);
            self.shared
                .requested_buffer_frames
                .store(doubled, Ordering::Relaxed);
            self.shared.panic_request.store(true, Ordering::Release);
            self.telemetry.publish(TelemetryEvent::Overrun {
                render_ns: stats.p95_ns,
                budget_ns: budget,
            });
            log::warn!(
                "Render overrun (p95 {:.2} ms, budget {:.2} ms, xruns {}): panicked, requesting {} frames",
                stats.p95_ns as f64 / 1e6,
                budget as f64 / 1e6,
                xruns,
                doubled
            );
        }
    }

    fn check_devices(&mut self, now: Instant) {
        while let Ok(event) = self.events.try_recv() {
            if let TelemetryEvent::DeviceError { id } = event {
                self.device_errors.entry(id).or_default().push_back(now);
            }
        }
        for (&id, window) in self.device_errors.iter_mut() {
            while window
                .front()
                .is_some_and(|&t| now.duration_since(t) > DEVICE_ERROR_WINDOW)
            {
                window.pop_front();
            }
            if window.len() > DEVICE_ERROR_LIMIT {
                log::warn!("{}: {} errors in the last minute, reopening", id, window.len());
                let _ = self.supervisor.send(SupervisorCommand::Reopen(id));
                window.clear();
            }
        }
    }

    fn check_drops(&mut self, now: Instant) {
        let Some(last_check) = self.last_drop_check else {
            self.last_drop_check = Some(now);
            self.last_drop_count = self.drops.get();
            return;
        };
        let elapsed = now.duration_since(last_check);
        if elapsed < Duration::from_secs(1) {
            return;
        }

        let count = self.drops.get();
        let rate = (count - self.last_drop_count) as f64 / elapsed.as_secs_f64();
        self.last_drop_count = count;
        self.last_drop_check = Some(now);

        if rate > DROP_RATE_LIMIT {
            self.high_drop_seconds += 1;
            if self.high_drop_seconds >= DROP_SUSTAIN_SECONDS && !self.drop_warned {
                // Event storm: user-visible by design, no automatic action
                log::warn!(
                    "Realtime bus dropping {:.0} events/s ({} total)",
                    rate,
                    count
                );
                self.telemetry.publish(TelemetryEvent::BusDrops(count));
                self.drop_warned = true;
            }
        } else {
            self.high_drop_seconds = 0;
            self.drop_warned = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::rt_channel;

    fn probe() -> (HealthProbe, Arc<AudioShared>, flume::Receiver<SupervisorCommand>) {
        let shared = AudioShared::new();
        let (bus_tx, _bus_rx) = rt_channel(8);
        let telemetry = Telemetry::new();
        let (sup_tx, sup_rx) = flume::unbounded();
        let probe = HealthProbe::new(shared.clone(), bus_tx.drop_counter(), telemetry, sup_tx);
        (probe, shared, sup_rx)
    }

    #[test]
    fn test_latency_stats() {
        let stats = latency_stats(vec![100, 200, 300, 400, 1_000]);
        assert_eq!(stats.avg_ns, 400);
        assert_eq!(stats.p95_ns, 1_000);
        assert_eq!(stats.samples, 5);
        assert_eq!(latency_stats(Vec::new()).samples, 0);
    }

    #[test]
    fn test_xrun_triggers_panic_and_buffer_doubling() {
        let (mut probe, shared, _sup_rx) = probe();
        shared.buffer_period_ns.store(5_000_000, Ordering::Relaxed);
        shared.buffer_frames.store(256, Ordering::Relaxed);

        probe.tick(Instant::now());
        assert!(!shared.panic_request.load(Ordering::Relaxed));

        shared.xruns.store(1, Ordering::Relaxed);
        probe.tick(Instant::now());
        assert!(shared.panic_request.load(Ordering::Relaxed));
        assert_eq!(shared.requested_buffer_frames.load(Ordering::Relaxed), 512);
    }

    #[test]
    fn test_overrun_acts_on_transition_only() {
        let (mut probe, shared, _sup_rx) = probe();
        shared.buffer_period_ns.store(1_000, Ordering::Relaxed);
        shared.buffer_frames.store(256, Ordering::Relaxed);
        // Every recorded call blows the 1us budget
        for _ in 0..32 {
            shared.latency.record(50_000);
        }

        probe.tick(Instant::now());
        assert!(shared.panic_request.swap(false, Ordering::AcqRel));

        // Still over budget, but no new xruns: no second panic
        probe.tick(Instant::now());
        assert!(!shared.panic_request.load(Ordering::Relaxed));
    }

    #[test]
    fn test_device_error_storm_requests_reopen() {
        let (mut probe, _shared, sup_rx) = probe();
        let id = DeviceId(7);
        let now = Instant::now();
        for _ in 0..=DEVICE_ERROR_LIMIT {
            probe.device_errors.entry(id).or_default().push_back(now);
        }
        probe.tick(now);
        assert_eq!(sup_rx.try_recv(), Ok(SupervisorCommand::Reopen(id)));
    }

    #[test]
    fn test_old_device_errors_age_out() {
        let (mut probe, _shared, sup_rx) = probe();
        let id = DeviceId(7);
        let old = Instant::now();
        for _ in 0..=DEVICE_ERROR_LIMIT {
            probe.device_errors.entry(id).or_default().push_back(old);
        }
        probe.tick(old + DEVICE_ERROR_WINDOW + Duration::from_secs(1));
        assert!(sup_rx.try_recv().is_err());
    }
}
