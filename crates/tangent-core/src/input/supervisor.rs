//! Device discovery, hot-plug and reader lifecycle
//!
//! The supervisor owns every reader. It scans `/dev/input` once at startup
//! and then once a second, classifies new devices by capability, grabs
//! them (with exponential backoff on grab failure) and spawns readers.
//! A reader that exits — unplug, fatal read error, or a health-probe
//! reopen — is reaped on the next scan; the path is then eligible to come
//! back as a brand-new device with a fresh id and no inherited state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evdev::Device;

use crate::bus::{Telemetry, TelemetryEvent};
use crate::error::InputError;
use crate::input::classify::{classify, DeviceClass};
use crate::input::reader::{spawn_reader, ReaderHandle};
use crate::pipeline::FanInMessage;
use crate::types::{DeviceId, InputEvent};

/// Grab retry schedule: 100 ms doubling, capped at 5 s, five attempts
const GRAB_ATTEMPTS: u32 = 5;
const GRAB_BACKOFF_BASE_MS: u64 = 100;
const GRAB_BACKOFF_CAP_MS: u64 = 5_000;

/// Hot-plug scan period
const SCAN_PERIOD: Duration = Duration::from_secs(1);

/// Commands from the health probe and the shutdown path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Close and re-open a misbehaving device's reader
    Reopen(DeviceId),
    Shutdown,
}

/// Public view of one active device
#[derive(Debug, Clone)]
pub struct DeviceView {
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    pub path: PathBuf,
}

/// Shared, read-only list of active devices for the UI
pub type DeviceList = Arc<Mutex<Vec<DeviceView>>>;

pub struct DeviceSupervisor {
    tx: flume::Sender<FanInMessage>,
    telemetry: Telemetry,
    grab: bool,
    touchpad_enabled: bool,
    readers: HashMap<PathBuf, ReaderHandle>,
    next_id: u32,
    devices: DeviceList,
}

impl DeviceSupervisor {
    pub fn new(
        tx: flume::Sender<FanInMessage>,
        telemetry: Telemetry,
        grab: bool,
        touchpad_enabled: bool,
    ) -> Self {
        Self {
            tx,
            telemetry,
            grab,
            touchpad_enabled,
            readers: HashMap::new(),
            next_id: 0,
            devices: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle for observers of the active device list.
    pub fn device_list(&self) -> DeviceList {
        self.devices.clone()
    }

    /// Initial discovery. Fails when no keyboard is usable — that is a
    /// startup error, unlike later hot-unplugs.
    pub fn initial_scan(&mut self) -> Result<(), InputError> {
        let mut permission_hit: Option<PathBuf> = None;
        self.scan(&mut permission_hit);
        let has_keyboard = self
            .readers
            .values()
            .any(|reader| reader.class == DeviceClass::Keyboard);
        if has_keyboard {
            Ok(())
        } else if let Some(path) = permission_hit {
            Err(InputError::Permission { path })
        } else {
            Err(InputError::NoKeyboard)
        }
    }

    /// Supervision loop: scan for arrivals/removals, service commands.
    pub fn run(mut self, commands: flume::Receiver<SupervisorCommand>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            match commands.recv_timeout(SCAN_PERIOD) {
                Ok(SupervisorCommand::Reopen(id)) => self.reopen(id),
                Ok(SupervisorCommand::Shutdown) | Err(flume::RecvTimeoutError::Disconnected) => {
                    break
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
            }
            let mut permission_hit = None;
            self.scan(&mut permission_hit);
        }
        self.shutdown();
    }

    fn scan(&mut self, permission_hit: &mut Option<PathBuf>) {
        // Reap readers whose threads have exited (unplug or fatal error);
        // the reader already emitted DeviceGone so held notes are released
        let finished: Vec<PathBuf> = self
            .readers
            .iter()
            .filter(|(_, reader)| reader.is_finished())
            .map(|(path, _)| path.clone())
            .collect();
        for path in finished {
            if let Some(reader) = self.readers.remove(&path) {
                log::info!("Device removed: {} ({})", reader.name, reader.id);
            }
        }

        for (path, device) in evdev::enumerate() {
            if self.readers.contains_key(&path) {
                continue;
            }
            self.try_adopt(path, device, permission_hit);
        }

        self.publish_view();
    }

    fn try_adopt(&mut self, path: PathBuf, device: Device, permission_hit: &mut Option<PathBuf>) {
        let Some(class) = classify(&device) else {
            return;
        };
        if class == DeviceClass::Touchpad && !self.touchpad_enabled {
            return;
        }

        let mut device = device;
        let name = device.name().unwrap_or("unnamed device").to_string();
        let grabbed = if self.grab {
            match grab_with_backoff(&mut device, &name) {
                Ok(()) => true,
                Err(err) => {
                    if err.kind() == std::io::ErrorKind::PermissionDenied {
                        *permission_hit = Some(path.clone());
                    }
                    log::warn!(
                        "Giving up on {} ({}): grab failed after {} attempts: {}",
                        name,
                        path.display(),
                        GRAB_ATTEMPTS,
                        err
                    );
                    return;
                }
            }
        } else {
            false
        };

        let id = DeviceId(self.next_id);
        self.next_id += 1;
        log::info!("{}: {} ({}) as {}", class, name, path.display(), id);
        let reader = spawn_reader(
            id,
            class,
            device,
            grabbed,
            self.tx.clone(),
            self.telemetry.clone(),
        );
        self.telemetry.publish(TelemetryEvent::DeviceUp {
            id,
            name: reader.name.clone(),
        });
        self.readers.insert(path, reader);
    }

    /// Close a reader on request; the next scan re-opens the path as a
    /// fresh device.
    fn reopen(&mut self, id: DeviceId) {
        let Some(path) = self
            .readers
            .iter()
            .find(|(_, reader)| reader.id == id)
            .map(|(path, _)| path.clone())
        else {
            return;
        };
        log::warn!("Reopening {} per health probe", id);
        if let Some(mut reader) = self.readers.remove(&path) {
            reader.stop();
        }
        // The stopped reader did not emit DeviceGone; release its notes
        let _ = self.tx.send(FanInMessage::Input {
            device: id,
            event: InputEvent::DeviceGone { id },
        });
        self.publish_view();
    }

    fn shutdown(&mut self) {
        for (_, mut reader) in self.readers.drain() {
            reader.stop();
        }
        self.publish_view();
    }

    fn publish_view(&self) {
        let view: Vec<DeviceView> = self
            .readers
            .iter()
            .map(|(path, reader)| DeviceView {
                id: reader.id,
                name: reader.name.clone(),
                class: reader.class,
                path: path.clone(),
            })
            .collect();
        *self.devices.lock().unwrap() = view;
    }
}

/// Grab with the documented backoff schedule.
fn grab_with_backoff(device: &mut Device, name: &str) -> std::io::Result<()> {
    let mut delay = GRAB_BACKOFF_BASE_MS;
    let mut last_err = None;
    for attempt in 1..=GRAB_ATTEMPTS {
        match device.grab() {
            Ok(()) => return Ok(()),
            Err(err) => {
                log::debug!("Grab attempt {}/{} on {} failed: {}", attempt, GRAB_ATTEMPTS, name, err);
                last_err = Some(err);
                if attempt < GRAB_ATTEMPTS {
                    std::thread::sleep(Duration::from_millis(delay));
                    delay = (delay * 2).min(GRAB_BACKOFF_CAP_MS);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("grab failed")))
}
