//! Renderer contract and the audio-side adapter
//!
//! The sample renderer (FluidSynth in production) is a consumed service:
//! the [`Renderer`] trait is everything the pipeline knows about it. The
//! [`RendererAdapter`] is the only code running in the audio context — each
//! callback it drains a bounded slice of the realtime bus, forwards the
//! events, derives arp clock ticks from the buffer position, and asks the
//! renderer for samples. It owns no other state and never allocates inside
//! `render`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::arp::ArpClock;
use crate::bus::BusConsumer;
use crate::error::RendererError;
use crate::types::{NoteEvent, ALL_NOTES_OFF_CC, RESET_CONTROLLERS_CC};

/// Maximum bus events applied per render call, so one flooded buffer cannot
/// blow the deadline
pub const MAX_EVENTS_PER_RENDER: usize = 256;

/// Slots in the render-latency ring
pub const LATENCY_RING_SIZE: usize = 256;

/// Identifier of a loaded soundfont
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundFontId(pub u32);

/// The consumed sample-renderer contract.
///
/// `render` must be callable from the audio context without blocking.
/// Velocity on `note_on` is always >= 1; `cc` values are in [0, 127];
/// `pitch_bend` is in [-8192, 8191].
pub trait Renderer: Send {
    fn load_soundfont(&mut self, path: &Path) -> Result<SoundFontId, RendererError>;
    fn program_change(&mut self, channel: u8, program: u8);
    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8);
    fn note_off(&mut self, channel: u8, pitch: u8);
    fn cc(&mut self, channel: u8, controller: u8, value: u8);
    fn pitch_bend(&mut self, channel: u8, value: i16);
    /// Write interleaved stereo samples covering `out.len() / 2` frames.
    fn render(&mut self, out: &mut [f32]) -> Result<(), RendererError>;
    /// Attempt recovery after a render failure.
    fn reset(&mut self) -> Result<(), RendererError> {
        Ok(())
    }
}

/// Renderer that produces silence and accepts everything.
///
/// Used for headless operation and as the fallback after the real renderer
/// fails twice; inputs keep producing events, rendering is a no-op.
pub struct SilentRenderer;

impl Renderer for SilentRenderer {
    fn load_soundfont(&mut self, _path: &Path) -> Result<SoundFontId, RendererError> {
        Ok(SoundFontId(0))
    }
    fn program_change(&mut self, _channel: u8, _program: u8) {}
    fn note_on(&mut self, _channel: u8, _pitch: u8, _velocity: u8) {}
    fn note_off(&mut self, _channel: u8, _pitch: u8) {}
    fn cc(&mut self, _channel: u8, _controller: u8, _value: u8) {}
    fn pitch_bend(&mut self, _channel: u8, _value: i16) {}
    fn render(&mut self, out: &mut [f32]) -> Result<(), RendererError> {
        out.fill(0.0);
        Ok(())
    }
}

/// Fixed ring of render-call durations, written by the audio thread and
/// read by the health probe. Zero entries mean "not yet filled".
pub struct LatencyRing {
    samples: [AtomicU64; LATENCY_RING_SIZE],
    idx: AtomicUsize,
}

impl LatencyRing {
    pub fn new() -> Self {
        Self {
            samples: std::array::from_fn(|_| AtomicU64::new(0)),
            idx: AtomicUsize::new(0),
        }
    }

    /// Record one render duration in nanoseconds. Wait-free.
    pub fn record(&self, ns: u64) {
        let i = self.idx.fetch_add(1, Ordering::Relaxed) % LATENCY_RING_SIZE;
        // Durations of 0 ns mark empty slots; round up so real samples count
        self.samples[i].store(ns.max(1), Ordering::Relaxed);
    }

    /// Copy out the populated samples (probe side; may allocate).
    pub fn snapshot(&self) -> Vec<u64> {
        self.samples
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&ns| ns > 0)
            .collect()
    }
}

impl Default for LatencyRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free state shared between the audio thread, the fan-in task and
/// the health probe. Flags only; everything structural stays owned.
pub struct AudioShared {
    pub latency: LatencyRing,
    pub xruns: AtomicU64,
    pub callbacks: AtomicU64,
    /// Render budget per callback; set when the stream opens
    pub buffer_period_ns: AtomicU64,
    /// Negotiated buffer size in frames; set when the stream opens
    pub buffer_frames: AtomicU32,
    /// Health probe's buffer-doubling request, picked up on stream rebuild
    pub requested_buffer_frames: AtomicU32,
    /// One-shot panic request (health probe or shutdown path)
    pub panic_request: AtomicBool,
    /// Whether the arp clock should produce ticks
    pub arp_active: AtomicBool,
}

impl AudioShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latency: LatencyRing::new(),
            xruns: AtomicU64::new(0),
            callbacks: AtomicU64::new(0),
            buffer_period_ns: AtomicU64::new(0),
            buffer_frames: AtomicU32::new(0),
            requested_buffer_frames: AtomicU32::new(0),
            panic_request: AtomicBool::new(false),
            arp_active: AtomicBool::new(false),
        })
    }
}

/// One arp clock tick, carried audio -> input over an SPSC ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpTick {
    pub index: u64,
}

/// Capacity of the tick ring; ticks are tiny and drained every fan-in loop
pub const TICK_RING_CAPACITY: usize = 64;

/// Create the tick ring (audio-thread producer, fan-in consumer).
pub fn tick_channel() -> (rtrb::Producer<ArpTick>, rtrb::Consumer<ArpTick>) {
    rtrb::RingBuffer::new(TICK_RING_CAPACITY)
}

/// The audio-context half of the pipeline.
pub struct RendererAdapter<R: Renderer> {
    renderer: R,
    consumer: BusConsumer,
    shared: Arc<AudioShared>,
    ticks: rtrb::Producer<ArpTick>,
    clock: ArpClock,
    tick_count: u64,
    /// Channels swept by a panic
    channels: [u8; 2],
    render_failures: u8,
    silent: bool,
}

impl<R: Renderer> RendererAdapter<R> {
    pub fn new(
        renderer: R,
        consumer: BusConsumer,
        shared: Arc<AudioShared>,
        ticks: rtrb::Producer<ArpTick>,
        clock: ArpClock,
        channels: [u8; 2],
    ) -> Self {
        Self {
            renderer,
            consumer,
            shared,
            ticks,
            clock,
            tick_count: 0,
            channels,
            render_failures: 0,
            silent: false,
        }
    }

    /// Fill `out` (interleaved stereo, `frames * 2` samples) for one
    /// callback: apply pending events, advance the arp clock, render.
    pub fn render(&mut self, frames: usize, out: &mut [f32]) {
        debug_assert_eq!(out.len(), frames * 2);
        let start = Instant::now();
        self.shared.callbacks.fetch_add(1, Ordering::Relaxed);

        if self.shared.panic_request.swap(false, Ordering::AcqRel) {
            self.apply(NoteEvent::Panic);
        }

        for _ in 0..MAX_EVENTS_PER_RENDER {
            match self.consumer.pop() {
                Some(event) => self.apply(event),
                None => break,
            }
        }

        self.clock
            .set_active(self.shared.arp_active.load(Ordering::Relaxed));
        for _ in 0..self.clock.advance(frames) {
            // Full ring means the fan-in is stalled; losing a tick only
            // stretches the arp step, never corrupts state
            let _ = self.ticks.push(ArpTick {
                index: self.tick_count,
            });
            self.tick_count += 1;
        }

        if self.silent {
            out.fill(0.0);
        } else if let Err(err) = self.renderer.render(out) {
            out.fill(0.0);
            self.on_render_failure(err);
        }

        let elapsed = start.elapsed().as_nanos() as u64;
        self.shared.latency.record(elapsed);
        let budget = self.shared.buffer_period_ns.load(Ordering::Relaxed);
        if budget > 0 && elapsed > budget {
            self.shared.xruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn apply(&mut self, event: NoteEvent) {
        match event {
            NoteEvent::On {
                pitch,
                velocity,
                channel,
                ..
            } => self.renderer.note_on(channel, pitch, velocity),
            NoteEvent::Off { pitch, channel, .. } => self.renderer.note_off(channel, pitch),
            NoteEvent::Cc {
                channel,
                controller,
                value,
            } => self.renderer.cc(channel, controller, value),
            NoteEvent::Bend { channel, value } => self.renderer.pitch_bend(channel, value),
            NoteEvent::Program { channel, program } => {
                self.renderer.program_change(channel, program)
            }
            NoteEvent::Panic => {
                for &channel in &self.channels {
                    self.renderer.cc(channel, ALL_NOTES_OFF_CC, 0);
                    self.renderer.cc(channel, RESET_CONTROLLERS_CC, 0);
                }
            }
        }
    }

    fn on_render_failure(&mut self, err: RendererError) {
        self.render_failures += 1;
        match self.render_failures {
            // NOTE: logging here is not RT-safe, but render failure is a
            // rare terminal event and the diagnostics matter more than one
            // late buffer.
            1 => {
                log::error!("Renderer failed, attempting re-init: {}", err);
                self.apply(NoteEvent::Panic);
                if let Err(reinit) = self.renderer.reset() {
                    log::error!("Renderer re-init failed: {}", reinit);
                    self.silent = true;
                }
            }
            2 => {
                log::error!("Renderer failed again, continuing in silent mode: {}", err);
                self.silent = true;
            }
            _ => {}
        }
    }

    /// Whether the adapter has fallen back to silence
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Access the wrapped renderer (setup and tests)
    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::ArpClock;
    use crate::bus::rt_channel;
    use crate::types::Origin;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        On(u8, u8, u8),
        Off(u8, u8),
        Cc(u8, u8, u8),
    }

    struct MockRenderer {
        calls: Arc<Mutex<Vec<Call>>>,
        fail: bool,
    }

    impl Renderer for MockRenderer {
        fn load_soundfont(&mut self, _path: &Path) -> Result<SoundFontId, RendererError> {
            Ok(SoundFontId(1))
        }
        fn program_change(&mut self, _channel: u8, _program: u8) {}
        fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8) {
            self.calls.lock().unwrap().push(Call::On(channel, pitch, velocity));
        }
        fn note_off(&mut self, channel: u8, pitch: u8) {
            self.calls.lock().unwrap().push(Call::Off(channel, pitch));
        }
        fn cc(&mut self, channel: u8, controller: u8, value: u8) {
            self.calls.lock().unwrap().push(Call::Cc(channel, controller, value));
        }
        fn pitch_bend(&mut self, _channel: u8, _value: i16) {}
        fn render(&mut self, out: &mut [f32]) -> Result<(), RendererError> {
            if self.fail {
                return Err(RendererError::Render("mock failure".into()));
            }
            out.fill(0.25);
            Ok(())
        }
    }

    fn adapter(
        fail: bool,
    ) -> (
        RendererAdapter<MockRenderer>,
        crate::bus::BusProducer,
        Arc<Mutex<Vec<Call>>>,
    ) {
        let (tx, rx) = rt_channel(64);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let renderer = MockRenderer {
            calls: calls.clone(),
            fail,
        };
        let (tick_tx, _tick_rx) = tick_channel();
        let adapter = RendererAdapter::new(
            renderer,
            rx,
            AudioShared::new(),
            tick_tx,
            ArpClock::new(48_000, 120.0, 4),
            [0, 1],
        );
        (adapter, tx, calls)
    }

    #[test]
    fn test_events_forwarded_in_order() {
        let (mut adapter, tx, calls) = adapter(false);
        tx.push(NoteEvent::On {
            pitch: 60,
            velocity: 100,
            channel: 0,
            origin: Origin::Keyboard,
        });
        tx.push(NoteEvent::Off {
            pitch: 60,
            channel: 0,
            origin: Origin::Keyboard,
        });

        let mut out = [0f32; 128];
        adapter.render(64, &mut out);

        assert_eq!(
            *calls.lock().unwrap(),
            vec![Call::On(0, 60, 100), Call::Off(0, 60)]
        );
        assert_eq!(out[0], 0.25);
    }

    #[test]
    fn test_panic_sweeps_both_channels() {
        let (mut adapter, tx, calls) = adapter(false);
        tx.push(NoteEvent::Panic);
        let mut out = [0f32; 128];
        adapter.render(64, &mut out);

        let calls = calls.lock().unwrap();
        assert!(calls.contains(&Call::Cc(0, ALL_NOTES_OFF_CC, 0)));
        assert!(calls.contains(&Call::Cc(1, ALL_NOTES_OFF_CC, 0)));
    }

    #[test]
    fn test_render_failure_goes_silent_after_retry() {
        let (mut adapter, _tx, _calls) = adapter(true);
        let mut out = [1f32; 128];
        adapter.render(64, &mut out);
        // First failure: output zeroed, re-init attempted
        assert_eq!(out[0], 0.0);
        assert!(!adapter.is_silent());

        adapter.render(64, &mut out);
        assert!(adapter.is_silent());

        // Silent mode still drains events and fills silence
        adapter.render(64, &mut out);
        assert_eq!(out[37], 0.0);
    }

    #[test]
    fn test_latency_ring_records_calls() {
        let (mut adapter, _tx, _calls) = adapter(false);
        let mut out = [0f32; 128];
        for _ in 0..10 {
            adapter.render(64, &mut out);
        }
        assert!(adapter.shared.latency.snapshot().len() >= 10);
    }

    #[test]
    fn test_bounded_drain_leaves_excess_queued() {
        let (mut adapter, tx, calls) = adapter(false);
        for _ in 0..(MAX_EVENTS_PER_RENDER + 10) {
            tx.push(NoteEvent::Cc {
                channel: 0,
                controller: 1,
                value: 64,
            });
        }
        let mut out = [0f32; 128];
        adapter.render(64, &mut out);
        assert_eq!(calls.lock().unwrap().len(), MAX_EVENTS_PER_RENDER);
        adapter.render(64, &mut out);
        assert_eq!(calls.lock().unwrap().len(), MAX_EVENTS_PER_RENDER + 10);
    }
}
