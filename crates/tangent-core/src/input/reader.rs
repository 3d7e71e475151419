//! Per-device reader threads
//!
//! One reader per device file. The loop polls the fd with a 5 ms timeout,
//! fetches whatever events are ready, normalizes them into [`InputEvent`]s
//! and hands them to the fan-in channel. The poll timeout doubles as the
//! ghost filter's flush tick, so parked key-ups are never held longer than
//! one poll interval.
//!
//! Any read error other than EAGAIN/EINTR is terminal: the reader emits a
//! final `DeviceGone` and exits, which is also how unplugs (EIO/ENODEV)
//! surface. The supervisor notices the exited thread on its next scan.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use evdev::{Device, InputEventKind};
use nix::poll::{poll, PollFd, PollFlags};

use crate::bus::{Telemetry, TelemetryEvent};
use crate::clock::monotonic_ns;
use crate::input::classify::{AxisCalibration, DeviceClass};
use crate::input::ghost::GhostFilter;
use crate::pipeline::FanInMessage;
use crate::types::{Axis, DeviceId, InputEvent, RawKey};

/// Poll timeout; the upper bound on how long a read can block
const POLL_TIMEOUT_MS: i32 = 5;

/// A running reader thread.
pub struct ReaderHandle {
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    /// Whether the reader thread has exited (device gone or stopped).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Ask the reader to stop and wait for it. Returns within one poll
    /// interval plus the time to drain the current batch.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawn the reader thread for an opened (and possibly grabbed) device.
pub fn spawn_reader(
    id: DeviceId,
    class: DeviceClass,
    mut device: Device,
    grabbed: bool,
    tx: flume::Sender<FanInMessage>,
    telemetry: Telemetry,
) -> ReaderHandle {
    let name = device.name().unwrap_or("unnamed device").to_string();
    let calibration = match class {
        DeviceClass::Touchpad => AxisCalibration::probe(&device),
        DeviceClass::Keyboard => AxisCalibration::default(),
    };
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let thread_name = format!("tangent-reader-{}", id.0);
    let thread = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            read_loop(id, class, &mut device, calibration, &tx, &telemetry, &stop_flag);
            if grabbed {
                let _ = device.ungrab();
            }
        })
        .expect("spawn reader thread");

    ReaderHandle {
        id,
        name,
        class,
        stop,
        thread: Some(thread),
    }
}

fn read_loop(
    id: DeviceId,
    class: DeviceClass,
    device: &mut Device,
    calibration: AxisCalibration,
    tx: &flume::Sender<FanInMessage>,
    telemetry: &Telemetry,
    stop: &AtomicBool,
) {
    let fd = device.as_raw_fd();
    let mut ghost = GhostFilter::new();
    let mut flushed: Vec<(RawKey, u64)> = Vec::with_capacity(8);

    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }

        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, POLL_TIMEOUT_MS) {
            Ok(0) => {
                // Timeout: a chance to deliver parked ghost-filter ups
                flush_ghosts(id, &mut ghost, &mut flushed, tx);
                continue;
            }
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                log::warn!("{}: poll failed: {}", id, err);
                telemetry.publish(TelemetryEvent::DeviceError { id });
                let _ = tx.send(FanInMessage::Input {
                    device: id,
                    event: InputEvent::DeviceGone { id },
                });
                return;
            }
        }

        match device.fetch_events() {
            Ok(events) => {
                let now = monotonic_ns();
                for event in events {
                    if let Some(input) = translate(class, &calibration, &mut ghost, event, now) {
                        if tx
                            .send(FanInMessage::Input {
                                device: id,
                                event: input,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                flush_ghosts(id, &mut ghost, &mut flushed, tx);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => {
                // EIO/ENODEV on unplug lands here
                log::info!("{}: read ended: {}", id, err);
                telemetry.publish(TelemetryEvent::DeviceError { id });
                let _ = tx.send(FanInMessage::Input {
                    device: id,
                    event: InputEvent::DeviceGone { id },
                });
                return;
            }
        }
    }
}

fn flush_ghosts(
    id: DeviceId,
    ghost: &mut GhostFilter,
    scratch: &mut Vec<(RawKey, u64)>,
    tx: &flume::Sender<FanInMessage>,
) {
    ghost.flush(monotonic_ns(), scratch);
    for (raw, t) in scratch.drain(..) {
        let _ = tx.send(FanInMessage::Input {
            device: id,
            event: InputEvent::KeyUp { raw, t },
        });
    }
}

/// Normalize one kernel event, applying the ghost filter to key events.
fn translate(
    class: DeviceClass,
    calibration: &AxisCalibration,
    ghost: &mut GhostFilter,
    event: evdev::InputEvent,
    now: u64,
) -> Option<InputEvent> {
    match event.kind() {
        InputEventKind::Key(key) => {
            if key == evdev::Key::BTN_TOUCH {
                return Some(InputEvent::Touch {
                    on: event.value() != 0,
                    t: now,
                });
            }
            let down = match event.value() {
                0 => false,
                1 => true,
                // Autorepeat never reaches the note path
                _ => return None,
            };
            let raw = RawKey(key.code());
            ghost.filter(raw, down, now).then(|| {
                if down {
                    InputEvent::KeyDown { raw, t: now }
                } else {
                    InputEvent::KeyUp { raw, t: now }
                }
            })
        }
        InputEventKind::AbsAxis(axis) if class == DeviceClass::Touchpad => {
            use evdev::AbsoluteAxisType as A;
            let (axis, range) = match axis {
                A::ABS_X | A::ABS_MT_POSITION_X => (Axis::X, calibration.x),
                A::ABS_Y | A::ABS_MT_POSITION_Y => (Axis::Y, calibration.y),
                A::ABS_PRESSURE | A::ABS_MT_PRESSURE => (Axis::Pressure, calibration.pressure),
                _ => return None,
            };
            Some(InputEvent::AxisMove {
                axis,
                normalized: AxisCalibration::normalize(range, event.value()),
                t: now,
            })
        }
        _ => None,
    }
}
