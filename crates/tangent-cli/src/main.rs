//! Tangent — play your laptop like a synthesizer
//!
//! The binary wires the pieces together and owns nothing else:
//!
//! 1. parse CLI / environment, load and validate config
//! 2. discover input devices and spawn the supervisor
//! 3. spawn the fan-in pipeline thread
//! 4. start the audio stream (or the headless clock) around the renderer
//!    adapter
//! 5. run the health probe until a signal arrives
//!
//! Shutdown drains the input side first so the last keystroke still plays,
//! then panics the audio side, with a hard 2-second deadline behind it.

mod cli;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use tangent_core::arp::ArpClock;
use tangent_core::audio::{run_headless, start_audio, NegotiatedFormat};
use tangent_core::bus::{rt_channel, Telemetry};
use tangent_core::config::{
    default_config_path, default_state_path, Config, PersistedState,
};
use tangent_core::health::HealthProbe;
use tangent_core::input::{DeviceSupervisor, SupervisorCommand};
use tangent_core::keymap::KeyMap;
use tangent_core::pipeline::Pipeline;
use tangent_core::render::{tick_channel, AudioShared, Renderer, RendererAdapter, SilentRenderer};
use tangent_core::types::{DeviceId, LAYER_CHANNEL, PRIMARY_CHANNEL};

const EXIT_OK: i32 = 0;
const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

/// Fan-in queue depth; readers block briefly rather than drop input
const FAN_IN_DEPTH: usize = 1024;

/// Device id for the external MIDI port (readers count up from 0)
const MIDI_DEVICE: DeviceId = DeviceId(1_000_000);

/// Hard shutdown deadline
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

fn main() {
    let args = cli::Cli::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();

    let env = match cli::EnvOverrides::read() {
        Ok(env) => env,
        Err(err) => {
            eprintln!("tangent: {}", err);
            std::process::exit(EXIT_USAGE);
        }
    };

    match run(args, env) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            // One line per fatal exit; details are in the log
            eprintln!("tangent: {:#}", err);
            std::process::exit(EXIT_INIT_FAILURE);
        }
    }
}

fn run(args: cli::Cli, env: cli::EnvOverrides) -> anyhow::Result<i32> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path).context("loading config")?;

    // Persisted state seeds the config, then env and CLI override it
    let state_path = default_state_path();
    let persisted = PersistedState::load(&state_path);
    config.keyboard.octave = persisted.last_octave.min(8);
    config.keyboard.program = persisted.last_program.min(127);
    config.layer.program = persisted.layer_program.min(127);
    config.velocity.mode = persisted.velocity_mode;

    let soundfont = cli::apply_overrides(&mut config, &env, &args);
    config.validate().context("validating config")?;

    if let Some(path) = &soundfont {
        if !path.exists() {
            anyhow::bail!("soundfont not found: {}", path.display());
        }
    }

    // Signals first, so an early Ctrl-C still exits 130
    let term = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, term.clone())
            .context("registering signal handler")?;
    }
    signal_hook::flag::register(signal_hook::consts::SIGINT, interrupted.clone())
        .context("registering signal handler")?;

    // Shared plumbing
    let telemetry = Telemetry::new();
    let (bus_tx, bus_rx) = rt_channel(tangent_core::bus::RT_RING_CAPACITY);
    let drop_counter = bus_tx.drop_counter();
    let shared = AudioShared::new();
    let (fanin_tx, fanin_rx) = flume::bounded(FAN_IN_DEPTH);
    let (tick_tx, tick_rx) = tick_channel();
    let (supervisor_tx, supervisor_rx) = flume::unbounded();

    // Input discovery; no usable keyboard is a startup failure
    let mut supervisor = DeviceSupervisor::new(
        fanin_tx.clone(),
        telemetry.clone(),
        config.keyboard.grab,
        config.touchpad.enabled,
    );
    supervisor.initial_scan().context("discovering input devices")?;
    let device_list = supervisor.device_list();
    for device in device_list.lock().unwrap().iter() {
        log::info!("Using {}: {}", device.class, device.name);
    }

    // Fan-in pipeline
    let keymap = KeyMap::with_overrides(&config.keyboard.keymap);
    let mut pipeline = Pipeline::new(&config, keymap, bus_tx, telemetry.clone(), shared.clone());
    pipeline.restore(&PersistedState {
        last_octave: config.keyboard.octave,
        last_program: config.keyboard.program,
        layer_program: config.layer.program,
        layer_on: persisted.layer_on,
        arp_mode: persisted.arp_mode,
        velocity_mode: config.velocity.mode,
        soundfont_favorites: Vec::new(),
    });
    pipeline.prime();

    let running = Arc::new(AtomicBool::new(true));

    let pipeline_thread = {
        let running = running.clone();
        std::thread::Builder::new()
            .name("tangent-fanin".into())
            .spawn(move || pipeline.run(fanin_rx, tick_rx, running))
            .context("spawning fan-in thread")?
    };

    let supervisor_thread = {
        let running = running.clone();
        std::thread::Builder::new()
            .name("tangent-supervisor".into())
            .spawn(move || supervisor.run(supervisor_rx, running))
            .context("spawning supervisor thread")?
    };

    // External MIDI is best-effort: its absence never stops a performance
    let _midi = if config.midi.enabled {
        match tangent_midi::MidiInputHandler::connect(
            config.midi.port.as_deref(),
            MIDI_DEVICE,
            fanin_tx.clone(),
        ) {
            Ok(handler) => {
                log::info!("MIDI input: {}", handler.port_name());
                Some(handler)
            }
            Err(err) => {
                log::warn!("MIDI input unavailable: {}", err);
                None
            }
        }
    } else {
        None
    };

    // Audio: real stream, or a timer-driven adapter when headless
    let arp = &config.arp;
    let make_adapter = {
        let shared = shared.clone();
        let soundfont = soundfont.clone();
        let (bpm, steps) = (arp.bpm, arp.steps_per_beat);
        move |format: NegotiatedFormat| {
            let mut renderer = SilentRenderer;
            if let Some(path) = &soundfont {
                match renderer.load_soundfont(path) {
                    Ok(id) => log::info!("Loaded soundfont {:?} as {:?}", path, id),
                    Err(err) => log::error!("Soundfont load failed: {}", err),
                }
            }
            RendererAdapter::new(
                renderer,
                bus_rx,
                shared,
                tick_tx,
                ArpClock::new(format.sample_rate, bpm, steps),
                [PRIMARY_CHANNEL, LAYER_CHANNEL],
            )
        }
    };

    let mut _audio_handle = None;
    let mut headless_thread = None;
    if args.headless {
        let format = NegotiatedFormat {
            sample_rate: config.audio.sample_rate,
            buffer_frames: config.audio.buffer_frames,
            channels: 2,
        };
        let adapter = make_adapter(format);
        let shared = shared.clone();
        let running = running.clone();
        headless_thread = Some(
            std::thread::Builder::new()
                .name("tangent-headless".into())
                .spawn(move || run_headless(adapter, format, &shared, running))
                .context("spawning headless clock")?,
        );
    } else {
        let handle = start_audio(&config.audio, &shared, make_adapter)
            .context("starting audio")?;
        log::info!(
            "Output latency ~{:.1} ms ({} frames @ {} Hz)",
            handle.latency_ms(),
            handle.buffer_frames(),
            handle.sample_rate()
        );
        _audio_handle = Some(handle);
    }

    let health_thread = {
        let running = running.clone();
        let probe = HealthProbe::new(shared.clone(), drop_counter, telemetry.clone(), supervisor_tx.clone());
        std::thread::Builder::new()
            .name("tangent-health".into())
            .spawn(move || probe.run(running))
            .context("spawning health probe")?
    };

    log::info!("Tangent ready — play the keyboard, Esc panics, Ctrl-C quits");

    // Park until a signal; surface the health probe's buffer request once
    let mut buffer_notice = false;
    while !term.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        let requested = shared.requested_buffer_frames.load(Ordering::Relaxed);
        let current = shared.buffer_frames.load(Ordering::Relaxed);
        if requested > current && !buffer_notice {
            log::warn!(
                "Audio overruns: set audio.buffer_frames to {} (takes effect on restart)",
                requested
            );
            buffer_notice = true;
        }
    }

    let exit_code = if interrupted.load(Ordering::Relaxed) {
        EXIT_INTERRUPTED
    } else {
        EXIT_OK
    };

    // Hard deadline: if orderly shutdown stalls, the process exits anyway.
    // The audio driver is closed by then either way.
    std::thread::spawn(move || {
        std::thread::sleep(SHUTDOWN_DEADLINE);
        std::process::exit(exit_code);
    });

    // Input side drains first so the last keystroke is played, then the
    // pipeline's final panic silences the renderer
    running.store(false, Ordering::Relaxed);
    let _ = supervisor_tx.send(SupervisorCommand::Shutdown);

    let snapshot = pipeline_thread
        .join()
        .map_err(|_| anyhow::anyhow!("fan-in thread panicked"))?;

    // Give the audio callback one buffer to apply the panic, then stop it
    std::thread::sleep(Duration::from_millis(50));
    drop(_audio_handle);
    if let Some(thread) = headless_thread {
        let _ = thread.join();
    }
    let _ = supervisor_thread.join();
    let _ = health_thread.join();

    // Persist performance state atomically
    let state = PersistedState {
        last_program: snapshot.program,
        last_octave: snapshot.octave,
        layer_on: snapshot.layer_on,
        layer_program: snapshot.layer_program,
        arp_mode: snapshot.arp_mode,
        velocity_mode: snapshot.velocity_mode,
        soundfont_favorites: persisted.soundfont_favorites,
    };
    if let Err(err) = state.save(&state_path) {
        log::warn!("Could not save state: {}", err);
    }

    Ok(exit_code)
}
