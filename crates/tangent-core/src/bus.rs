//! Lock-free event bus between the input thread and the audio thread
//!
//! Two channels cross this boundary:
//!
//! - The **realtime channel**: a bounded lossy ring with a single
//!   input-thread producer and a single audio-thread consumer. Pushing
//!   never blocks; when the ring is full the oldest pending event is
//!   displaced and a drop counter bumped, so a stalled audio callback can
//!   never starve the input thread. `Panic` bypasses the ring entirely
//!   through a one-shot flag the consumer checks before anything else,
//!   which is how it reaches the head of the queue.
//!
//! - The **telemetry channel**: a lossy broadcast for the UI and the
//!   health probe. Subscribers that fall behind lose events; nobody blocks
//!   on them.
//!
//! Within the realtime channel ordering is strict FIFO. Events are
//! value-typed (`Copy`); ownership transfers to the consumer on pop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::queue::ArrayQueue;

use crate::types::{DeviceId, NoteEvent, Origin};

/// Default realtime ring capacity (events)
pub const RT_RING_CAPACITY: usize = 4096;

/// Telemetry subscriber queue depth
const TELEMETRY_DEPTH: usize = 1024;

struct Shared {
    ring: ArrayQueue<NoteEvent>,
    dropped: AtomicU64,
    panic_pending: AtomicBool,
}

/// Create the realtime channel (producer/consumer pair).
///
/// The producer belongs to the fan-in task, the consumer to the renderer
/// adapter. Capacity is fixed at creation; nothing allocates afterwards.
pub fn rt_channel(capacity: usize) -> (BusProducer, BusConsumer) {
    let shared = Arc::new(Shared {
        ring: ArrayQueue::new(capacity),
        dropped: AtomicU64::new(0),
        panic_pending: AtomicBool::new(false),
    });
    (
        BusProducer {
            shared: shared.clone(),
        },
        BusConsumer { shared },
    )
}

/// Input-thread side of the realtime channel
pub struct BusProducer {
    shared: Arc<Shared>,
}

impl BusProducer {
    /// Submit an event.
    ///
    /// `Panic` is promoted: it is flagged rather than enqueued and the
    /// consumer yields it before any queued event. Everything else is
    /// appended; on overflow the displaced oldest event is counted.
    pub fn push(&self, event: NoteEvent) {
        if matches!(event, NoteEvent::Panic) {
            self.shared.panic_pending.store(true, Ordering::Release);
            return;
        }
        if self.shared.ring.force_push(event).is_some() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total events dropped since startup (monotonic)
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Handle for observers that only need the drop counter
    pub fn drop_counter(&self) -> DropCounter {
        DropCounter {
            shared: self.shared.clone(),
        }
    }
}

/// Audio-thread side of the realtime channel
pub struct BusConsumer {
    shared: Arc<Shared>,
}

impl BusConsumer {
    /// Pop the next event, `Panic` first if one is pending.
    pub fn pop(&mut self) -> Option<NoteEvent> {
        if self.shared.panic_pending.swap(false, Ordering::AcqRel) {
            return Some(NoteEvent::Panic);
        }
        self.shared.ring.pop()
    }

    /// Number of events currently queued
    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.ring.is_empty()
    }
}

/// Read-only view of the realtime channel's drop counter
#[derive(Clone)]
pub struct DropCounter {
    shared: Arc<Shared>,
}

impl DropCounter {
    pub fn get(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Events on the telemetry channel.
///
/// Everything the UI or health probe might want to display; loss here is
/// cosmetic, never correctness.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A note event was submitted to the realtime channel
    Note(NoteEvent),
    /// Strike velocity and its source, for the velocity meter
    Velocity { value: u8, origin: Origin },
    /// Device appeared and its reader is running
    DeviceUp { id: DeviceId, name: String },
    /// Device disappeared; held notes from it were released
    DeviceDown { id: DeviceId },
    /// A device reader reported an error
    DeviceError { id: DeviceId },
    /// Program change on a channel
    Program { channel: u8, program: u8 },
    /// Active voice count after the last allocator operation
    ActiveVoices(usize),
    /// Realtime channel drop counter crossed a reporting boundary
    BusDrops(u64),
    /// Renderer overrun detected by the health probe
    Overrun { render_ns: u64, budget_ns: u64 },
}

/// Lossy broadcast fan-out for telemetry.
///
/// Cloning shares the subscriber list. Publishing walks the list with
/// `try_send`; full or disconnected subscribers are skipped (the latter are
/// pruned lazily).
#[derive(Clone)]
pub struct Telemetry {
    subscribers: Arc<Mutex<Vec<flume::Sender<TelemetryEvent>>>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<TelemetryEvent> {
        let (tx, rx) = flume::bounded(TELEMETRY_DEPTH);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Broadcast an event to all live subscribers, never blocking.
    pub fn publish(&self, event: TelemetryEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => true,
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Origin;

    fn on(pitch: u8) -> NoteEvent {
        NoteEvent::On {
            pitch,
            velocity: 100,
            channel: 0,
            origin: Origin::Keyboard,
        }
    }

    #[test]
    fn test_fifo_order() {
        let (tx, mut rx) = rt_channel(8);
        tx.push(on(60));
        tx.push(on(62));
        tx.push(on(64));
        assert_eq!(rx.pop(), Some(on(60)));
        assert_eq!(rx.pop(), Some(on(62)));
        assert_eq!(rx.pop(), Some(on(64)));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let (tx, mut rx) = rt_channel(4);
        for pitch in 60..66 {
            tx.push(on(pitch));
        }
        assert_eq!(tx.dropped(), 2);
        // The two oldest (60, 61) were displaced
        assert_eq!(rx.pop(), Some(on(62)));
        assert_eq!(rx.pop(), Some(on(63)));
        assert_eq!(rx.pop(), Some(on(64)));
        assert_eq!(rx.pop(), Some(on(65)));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_drop_counter_is_monotonic() {
        let (tx, _rx) = rt_channel(2);
        let counter = tx.drop_counter();
        let mut last = 0;
        for pitch in 0..20 {
            tx.push(on(pitch));
            let now = counter.get();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_panic_promoted_to_head() {
        let (tx, mut rx) = rt_channel(8);
        tx.push(on(60));
        tx.push(on(62));
        tx.push(NoteEvent::Panic);
        assert_eq!(rx.pop(), Some(NoteEvent::Panic));
        // Earlier submissions still drain afterwards, in order
        assert_eq!(rx.pop(), Some(on(60)));
        assert_eq!(rx.pop(), Some(on(62)));
    }

    #[test]
    fn test_keeping_up_consumer_sees_no_drops() {
        let (tx, mut rx) = rt_channel(4);
        for pitch in 0..100 {
            tx.push(on(pitch));
            assert_eq!(rx.pop(), Some(on(pitch)));
        }
        assert_eq!(tx.dropped(), 0);
    }

    #[test]
    fn test_telemetry_broadcast_and_prune() {
        let telemetry = Telemetry::new();
        let rx1 = telemetry.subscribe();
        let rx2 = telemetry.subscribe();

        telemetry.publish(TelemetryEvent::ActiveVoices(3));
        assert!(matches!(rx1.try_recv(), Ok(TelemetryEvent::ActiveVoices(3))));
        assert!(matches!(rx2.try_recv(), Ok(TelemetryEvent::ActiveVoices(3))));

        drop(rx2);
        // Dead subscriber is pruned; publish still reaches the live one
        telemetry.publish(TelemetryEvent::ActiveVoices(4));
        assert!(matches!(rx1.try_recv(), Ok(TelemetryEvent::ActiveVoices(4))));
    }
}
