//! Input fan-in: one task that turns raw input into bus events
//!
//! Every device reader, the MIDI port, the arp tick ring and the
//! supervisory command channel converge here. This task is the only writer
//! of the state core, the velocity computer, the voice allocator and the
//! arp/layer transforms, and the only producer of the realtime bus — so
//! nothing in the note path is ever shared mutably across threads.
//!
//! Events from one device arrive in kernel order; across devices they
//! interleave in arrival order on the fan-in channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::arp::Arpeggiator;
use crate::bus::{BusProducer, Telemetry, TelemetryEvent};
use crate::clock::monotonic_ns;
use crate::config::Config;
use crate::gm::DEFAULT_PRESETS;
use crate::keymap::{note_name, note_number, ControlAction, KeyAction, KeyMap};
use crate::layer;
use crate::render::{ArpTick, AudioShared};
use crate::state::StateCore;
use crate::types::{
    Axis, DeviceId, InputEvent, NoteEvent, Origin, RawKey, VelocityInfo, BASELINE_VELOCITY,
    PRIMARY_CHANNEL, SUSTAIN_CC,
};
use crate::velocity::{VelocityComputer, VelocityMode};
use crate::voice::VoiceAllocator;

/// Ghosting window: a re-strike of the same key inside this window is a
/// matrix bounce, not a player action
const GHOST_WINDOW_NS: u64 = 1_000_000;

/// Modulation CC targets for the touchpad (filter cutoff, expression)
const FILTER_CUTOFF_CC: u8 = 74;
const EXPRESSION_CC: u8 = 11;

/// Commands from the supervisory context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineCommand {
    Panic,
    Shutdown,
}

/// Messages on the fan-in channel
#[derive(Debug, Clone)]
pub enum FanInMessage {
    Input { device: DeviceId, event: InputEvent },
    Command(PipelineCommand),
}

/// Final state handed back to the caller for persistence
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub octave: u8,
    pub transpose: i8,
    pub program: u8,
    pub layer_on: bool,
    pub layer_program: u8,
    pub arp_mode: crate::arp::ArpMode,
    pub velocity_mode: VelocityMode,
}

/// The fan-in task state. Built once, then moved into its thread.
pub struct Pipeline {
    keymap: KeyMap,
    state: StateCore,
    velocity: VelocityComputer,
    allocator: VoiceAllocator,
    arp: Arpeggiator,
    bus: BusProducer,
    telemetry: Telemetry,
    shared: Arc<AudioShared>,
    /// Whether a touchpad contact is active; pressure itself lives in the
    /// velocity computer
    touching: bool,
    /// Currently depressed note keys and the pitch they struck
    keys_down: HashMap<(DeviceId, RawKey), u8>,
    scratch: Vec<NoteEvent>,
    touch_modulation: bool,
    pitch_bend_semitones: u8,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        keymap: KeyMap,
        bus: BusProducer,
        telemetry: Telemetry,
        shared: Arc<AudioShared>,
    ) -> Self {
        let mut state = StateCore::new(config.keyboard.octave, config.keyboard.program);
        state.layer.program = config.layer.program;
        Self {
            keymap,
            state,
            velocity: VelocityComputer::new(config.velocity.clone()),
            allocator: VoiceAllocator::new(config.audio.max_polyphony),
            arp: Arpeggiator::new(config.arp.seed),
            bus,
            telemetry,
            shared,
            touching: false,
            keys_down: HashMap::with_capacity(32),
            scratch: Vec::with_capacity(64),
            touch_modulation: config.touchpad.modulation,
            pitch_bend_semitones: config.touchpad.pitch_bend_semitones,
        }
    }

    /// Re-apply state persisted from the previous run. Call before
    /// [`Self::prime`] so the programs it pushes are the restored ones.
    pub fn restore(&mut self, persisted: &crate::config::PersistedState) {
        self.state.octave = persisted.last_octave.min(crate::state::OCTAVE_MAX);
        self.state.set_program(persisted.last_program as i32);
        self.state.layer.on = persisted.layer_on;
        self.state.layer.program = persisted.layer_program.min(127);
        self.state.arp_mode = persisted.arp_mode;
        self.arp.set_mode(persisted.arp_mode);
        self.shared
            .arp_active
            .store(persisted.arp_mode.is_on(), Ordering::Relaxed);
    }

    /// Push the startup program selections and pitch-bend range so the
    /// renderer is configured before the first note.
    pub fn prime(&mut self) {
        let layer = self.state.layer;
        self.scratch.push(NoteEvent::Program {
            channel: PRIMARY_CHANNEL,
            program: self.state.program,
        });
        self.scratch.push(NoteEvent::Program {
            channel: layer.channel,
            program: layer.program,
        });
        // RPN 0,0: pitch bend sensitivity
        for channel in [PRIMARY_CHANNEL, layer.channel] {
            for (controller, value) in [
                (101u8, 0u8),
                (100, 0),
                (6, self.pitch_bend_semitones),
                (38, 0),
                (101, 127),
                (100, 127),
            ] {
                self.scratch.push(NoteEvent::Cc {
                    channel,
                    controller,
                    value,
                });
            }
        }
        self.flush();
    }

    /// Main loop: merge the fan-in channel and the arp tick ring until
    /// shutdown, then drain pending input and panic so nothing is left
    /// sounding.
    pub fn run(
        mut self,
        rx: flume::Receiver<FanInMessage>,
        mut ticks: rtrb::Consumer<ArpTick>,
        running: Arc<AtomicBool>,
    ) -> StateSnapshot {
        while running.load(Ordering::Relaxed) {
            match rx.recv_timeout(Duration::from_millis(2)) {
                Ok(FanInMessage::Input { device, event }) => self.handle_input(device, event),
                Ok(FanInMessage::Command(PipelineCommand::Panic)) => self.panic(),
                Ok(FanInMessage::Command(PipelineCommand::Shutdown)) => break,
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
            while ticks.pop().is_ok() {
                self.handle_tick(monotonic_ns());
            }
        }

        // Play out whatever the reader threads already delivered, then
        // silence everything.
        while let Ok(FanInMessage::Input { device, event }) = rx.try_recv() {
            self.handle_input(device, event);
        }
        self.panic();
        self.snapshot()
    }

    /// Voices currently occupying polyphony slots
    pub fn active_voices(&self) -> usize {
        self.allocator.active()
    }

    /// Live held notes across all channels
    pub fn held_notes(&self) -> usize {
        self.allocator.held_count()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            octave: self.state.octave,
            transpose: self.state.transpose,
            program: self.state.program,
            layer_on: self.state.layer.on,
            layer_program: self.state.layer.program,
            arp_mode: self.state.arp_mode,
            velocity_mode: self.velocity.config().mode,
        }
    }

    /// Dispatch one input event.
    pub fn handle_input(&mut self, device: DeviceId, event: InputEvent) {
        match event {
            InputEvent::KeyDown { raw, t } => self.key_down(device, raw, t),
            InputEvent::KeyUp { raw, t } => self.key_up(device, raw, t),
            InputEvent::AxisMove { axis, normalized, t } => self.axis(axis, normalized, t),
            InputEvent::Touch { on, t } => self.touch_state(on, t),
            InputEvent::Midi { status, d1, d2, t } => self.midi(status, d1, d2, t),
            InputEvent::DeviceGone { id } => self.device_gone(id),
        }
    }

    /// Advance the arpeggiator by one clock tick.
    pub fn handle_tick(&mut self, now: u64) {
        if !self.state.arp_mode.is_on() {
            return;
        }
        let step = self.arp.tick();
        if let Some(pitch) = step.release {
            self.note_off_layered(pitch, Origin::Arp, now);
        }
        if let Some(pitch) = step.strike {
            let velocity = self.arp_velocity();
            self.note_on_layered(pitch, velocity, Origin::Arp, now);
        }
        self.flush();
    }

    fn key_down(&mut self, device: DeviceId, raw: RawKey, t: u64) {
        let prev = self.state.touch_key(raw, t);
        let already_down = self.keys_down.contains_key(&(device, raw));
        if already_down && prev.is_some_and(|p| t.saturating_sub(p) < GHOST_WINDOW_NS) {
            // Matrix bounce that slipped past the reader filter
            return;
        }

        let action = self
            .keymap
            .action(raw, self.state.shift_held, self.state.ctrl_held);
        match action {
            Some(KeyAction::Control(control)) => self.control_down(control, t),
            Some(KeyAction::Note { offset, row }) => {
                let pitch = note_number(offset, self.state.octave, self.state.transpose);
                let info = self.velocity.strike(
                    t,
                    Some(row),
                    self.touching,
                    self.state.shift_held,
                    self.state.ctrl_held,
                );
                log::debug!("Key {:?} -> {} vel {}", raw, note_name(pitch), info.value);
                self.telemetry.publish(TelemetryEvent::Velocity {
                    value: info.value,
                    origin: Origin::Keyboard,
                });

                if already_down {
                    // Re-trigger: release the old strike first in case
                    // octave or transpose moved underneath the held key
                    if let Some(old) = self.keys_down.remove(&(device, raw)) {
                        self.release_struck(old, t);
                    }
                }
                self.keys_down.insert((device, raw), pitch);

                if self.state.arp_mode.is_on() {
                    self.arp.hold(pitch);
                } else {
                    self.note_on_layered(pitch, info, Origin::Keyboard, t);
                }
                self.flush();
            }
            None => {}
        }
    }

    fn key_up(&mut self, device: DeviceId, raw: RawKey, t: u64) {
        self.state.touch_key(raw, t);

        // Modifier and sustain releases act on the control table meaning
        // regardless of what else the key does
        match self.keymap.action(raw, false, false) {
            Some(KeyAction::Control(ControlAction::ShiftModifier)) => {
                self.state.shift_held = false;
                return;
            }
            Some(KeyAction::Control(ControlAction::CtrlModifier)) => {
                self.state.ctrl_held = false;
                return;
            }
            Some(KeyAction::Control(ControlAction::Sustain)) => {
                self.state.sustain_pressed = false;
                self.allocator
                    .set_sustain(false, t, &mut self.scratch);
                self.flush();
                return;
            }
            _ => {}
        }

        if let Some(pitch) = self.keys_down.remove(&(device, raw)) {
            self.release_struck(pitch, t);
            self.flush();
        }
    }

    /// Release a previously struck pitch. While the arp is on, key pitches
    /// live in its held set and only the set-emptied rule can stop the
    /// sounding note early.
    fn release_struck(&mut self, pitch: u8, t: u64) {
        if self.state.arp_mode.is_on() {
            if let Some(sounding) = self.arp.release(pitch) {
                // Held set emptied: the sounding arp note stops now
                self.note_off_layered(sounding, Origin::Arp, t);
            }
        } else {
            self.note_off_layered(pitch, Origin::Keyboard, t);
        }
    }

    fn control_down(&mut self, control: ControlAction, t: u64) {
        match control {
            ControlAction::ShiftModifier => self.state.shift_held = true,
            ControlAction::CtrlModifier => self.state.ctrl_held = true,
            ControlAction::OctaveUp => {
                self.state.octave_up();
            }
            ControlAction::OctaveDown => {
                self.state.octave_down();
            }
            ControlAction::TransposeUp => {
                self.state.transpose_up();
            }
            ControlAction::TransposeDown => {
                self.state.transpose_down();
            }
            ControlAction::ProgramUp => self.change_program(self.state.program as i32 + 1),
            ControlAction::ProgramDown => self.change_program(self.state.program as i32 - 1),
            ControlAction::Preset(slot) => {
                if let Some(&(program, _)) = DEFAULT_PRESETS.get(slot as usize) {
                    self.change_program(program as i32);
                }
            }
            ControlAction::Sustain => {
                self.state.sustain_pressed = true;
                self.allocator.set_sustain(true, t, &mut self.scratch);
                self.flush();
            }
            ControlAction::Panic => self.panic(),
            ControlAction::LayerToggle => self.toggle_layer(t),
            ControlAction::ArpToggle => self.toggle_arp(t),
        }
    }

    fn change_program(&mut self, program: i32) {
        self.state.set_program(program);
        log::debug!(
            "Program {} ({})",
            self.state.program,
            crate::gm::program_name(self.state.program)
        );
        self.scratch.push(NoteEvent::Program {
            channel: PRIMARY_CHANNEL,
            program: self.state.program,
        });
        self.telemetry.publish(TelemetryEvent::Program {
            channel: PRIMARY_CHANNEL,
            program: self.state.program,
        });
        self.flush();
    }

    fn toggle_layer(&mut self, t: u64) {
        self.state.layer.on = !self.state.layer.on;
        if self.state.layer.on {
            let layer = self.state.layer;
            self.scratch.push(NoteEvent::Program {
                channel: layer.channel,
                program: layer.program,
            });
        } else {
            self.allocator
                .release_origin(Origin::Layer, t, &mut self.scratch);
        }
        self.flush();
    }

    fn toggle_arp(&mut self, t: u64) {
        let was_on = self.state.arp_mode.is_on();
        let mode = self.state.cycle_arp();
        if let Some(sounding) = self.arp.set_mode(mode) {
            self.note_off_layered(sounding, Origin::Arp, t);
        }
        if mode.is_on() {
            if !was_on {
                // Keys already sounding move into the held set so the arp
                // picks them up on its first tick
                self.allocator
                    .release_origin(Origin::Keyboard, t, &mut self.scratch);
                if self.state.layer.on {
                    self.allocator
                        .release_origin(Origin::Layer, t, &mut self.scratch);
                }
                let held: Vec<u8> = self.keys_down.values().copied().collect();
                for pitch in held {
                    self.arp.hold(pitch);
                }
            }
            self.shared.arp_active.store(true, Ordering::Relaxed);
        } else {
            self.shared.arp_active.store(false, Ordering::Relaxed);
            self.arp.clear();
        }
        self.flush();
    }

    fn axis(&mut self, axis: Axis, normalized: f32, _t: u64) {
        match axis {
            Axis::X => {
                if self.touch_modulation {
                    let bipolar = (normalized - 0.5) * 2.0;
                    let value = (bipolar * 8191.0).round().clamp(-8192.0, 8191.0) as i16;
                    self.push_bend(value);
                }
            }
            Axis::Y => {
                if self.touch_modulation {
                    // Inverted: top of the pad opens the filter
                    let value = ((1.0 - normalized) * 127.0).round() as u8;
                    self.push_cc(FILTER_CUTOFF_CC, value.min(127));
                }
            }
            Axis::Pressure => {
                self.velocity.pressure_sample(normalized);
                if self.touch_modulation {
                    let value = (normalized * 127.0).round() as u8;
                    self.push_cc(EXPRESSION_CC, value.min(127));
                }
            }
        }
        self.flush();
    }

    fn touch_state(&mut self, on: bool, _t: u64) {
        self.touching = on;
        if !on {
            self.velocity.pressure_sample(0.0);
            if self.touch_modulation {
                // Re-center the bend when the finger lifts
                self.push_bend(0);
                self.push_cc(EXPRESSION_CC, 0);
            }
            self.flush();
        }
    }

    fn midi(&mut self, status: u8, d1: u8, d2: u8, t: u64) {
        match status & 0xF0 {
            0x90 => {
                // Note on with velocity 0 is a note off by MIDI convention
                if d2 == 0 {
                    self.allocator
                        .note_off(d1, PRIMARY_CHANNEL, Origin::MidiIn, t, &mut self.scratch);
                } else {
                    self.allocator.note_on(
                        d1.min(127),
                        d2.min(127).max(1),
                        PRIMARY_CHANNEL,
                        Origin::MidiIn,
                        t,
                        &mut self.scratch,
                    );
                    self.telemetry.publish(TelemetryEvent::Velocity {
                        value: d2.min(127),
                        origin: Origin::MidiIn,
                    });
                }
            }
            0x80 => {
                self.allocator
                    .note_off(d1, PRIMARY_CHANNEL, Origin::MidiIn, t, &mut self.scratch);
            }
            0xB0 => {
                if d1 == SUSTAIN_CC {
                    self.state.sustain_pressed = d2 >= 64;
                    self.allocator.set_sustain(d2 >= 64, t, &mut self.scratch);
                } else {
                    self.push_cc(d1.min(127), d2.min(127));
                }
            }
            0xC0 => {
                self.change_program(d1 as i32);
                return;
            }
            0xD0 => {
                // Channel aftertouch rides expression
                self.push_cc(EXPRESSION_CC, d1.min(127));
            }
            0xE0 => {
                let value = (((d2 as i16) << 7) | d1 as i16) - 8192;
                self.push_bend(value);
            }
            _ => return,
        }
        self.flush();
    }

    fn device_gone(&mut self, id: DeviceId) {
        let gone: Vec<(RawKey, u8)> = self
            .keys_down
            .iter()
            .filter(|((device, _), _)| *device == id)
            .map(|((_, raw), &pitch)| (*raw, pitch))
            .collect();
        let now = monotonic_ns();
        for (raw, pitch) in gone {
            self.keys_down.remove(&(id, raw));
            self.release_struck(pitch, now);
        }
        self.flush();
        self.telemetry.publish(TelemetryEvent::DeviceDown { id });
    }

    /// Release everything, everywhere.
    pub fn panic(&mut self) {
        self.allocator.panic();
        self.arp.clear();
        self.keys_down.clear();
        self.state.clear_key_times();
        self.scratch.push(NoteEvent::Panic);
        self.flush();
    }

    fn arp_velocity(&self) -> VelocityInfo {
        let config = self.velocity.config();
        let value = match config.mode {
            VelocityMode::Fixed => config.fixed.clamp(1, 127),
            _ => BASELINE_VELOCITY,
        };
        VelocityInfo::new(value, crate::types::VelocitySource::Fixed)
    }

    fn note_on_layered(&mut self, pitch: u8, info: VelocityInfo, origin: Origin, t: u64) {
        self.allocator.note_on(
            pitch,
            info.value,
            PRIMARY_CHANNEL,
            origin,
            t,
            &mut self.scratch,
        );
        if let Some(copy) = layer::duplicate_on(&self.state.layer, PRIMARY_CHANNEL, info.value) {
            self.allocator.note_on(
                pitch,
                copy.velocity,
                copy.channel,
                Origin::Layer,
                t,
                &mut self.scratch,
            );
        }
    }

    fn note_off_layered(&mut self, pitch: u8, origin: Origin, t: u64) {
        self.allocator
            .note_off(pitch, PRIMARY_CHANNEL, origin, t, &mut self.scratch);
        if let Some(channel) = layer::duplicate_off(&self.state.layer, PRIMARY_CHANNEL) {
            self.allocator
                .note_off(pitch, channel, Origin::Layer, t, &mut self.scratch);
        }
    }

    fn push_cc(&mut self, controller: u8, value: u8) {
        self.scratch.push(NoteEvent::Cc {
            channel: PRIMARY_CHANNEL,
            controller,
            value,
        });
        if self.state.layer.on {
            self.scratch.push(NoteEvent::Cc {
                channel: self.state.layer.channel,
                controller,
                value,
            });
        }
    }

    fn push_bend(&mut self, value: i16) {
        self.scratch.push(NoteEvent::Bend {
            channel: PRIMARY_CHANNEL,
            value,
        });
        if self.state.layer.on {
            self.scratch.push(NoteEvent::Bend {
                channel: self.state.layer.channel,
                value,
            });
        }
    }

    /// Submit buffered events to the bus and mirror them on telemetry.
    fn flush(&mut self) {
        if self.scratch.is_empty() {
            return;
        }
        let mut note_activity = false;
        for event in self.scratch.drain(..) {
            note_activity |= matches!(
                event,
                NoteEvent::On { .. } | NoteEvent::Off { .. } | NoteEvent::Panic
            );
            self.bus.push(event);
            self.telemetry.publish(TelemetryEvent::Note(event));
        }
        if note_activity {
            self.telemetry
                .publish(TelemetryEvent::ActiveVoices(self.allocator.active()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::rt_channel;

    fn pipeline() -> (Pipeline, crate::bus::BusConsumer) {
        let config = Config::default();
        let (tx, rx) = rt_channel(256);
        let pipeline = Pipeline::new(
            &config,
            KeyMap::default_layout(),
            tx,
            Telemetry::new(),
            AudioShared::new(),
        );
        (pipeline, rx)
    }

    fn drain(rx: &mut crate::bus::BusConsumer) -> Vec<NoteEvent> {
        std::iter::from_fn(|| rx.pop()).collect()
    }

    #[test]
    fn test_prime_pushes_programs_and_bend_range() {
        let (mut pipeline, mut rx) = pipeline();
        pipeline.prime();
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, NoteEvent::Program { channel: 0, program: 0 })));
        assert!(events
            .iter()
            .any(|e| matches!(e, NoteEvent::Program { channel: 1, .. })));
        // RPN select + data entry on both channels
        let rpn_writes = events
            .iter()
            .filter(|e| matches!(e, NoteEvent::Cc { controller: 100 | 101 | 6 | 38, .. }))
            .count();
        assert_eq!(rpn_writes, 12);
    }

    #[test]
    fn test_restore_applies_persisted_modes() {
        let (mut pipeline, _rx) = pipeline();
        let persisted = crate::config::PersistedState {
            last_octave: 3,
            last_program: 24,
            layer_on: true,
            arp_mode: crate::arp::ArpMode::Up,
            ..Default::default()
        };
        pipeline.restore(&persisted);
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.octave, 3);
        assert_eq!(snapshot.program, 24);
        assert!(snapshot.layer_on);
        assert_eq!(snapshot.arp_mode, crate::arp::ArpMode::Up);
        assert!(pipeline.shared.arp_active.load(Ordering::Relaxed));
    }

    #[test]
    fn test_tick_without_arp_is_inert() {
        let (mut pipeline, mut rx) = pipeline();
        pipeline.handle_tick(0);
        assert!(drain(&mut rx).is_empty());
    }
}
