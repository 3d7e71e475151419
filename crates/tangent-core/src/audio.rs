//! CPAL audio backend
//!
//! Builds the output stream that drives the renderer adapter. The adapter
//! is moved into the callback closure — the audio thread owns it outright,
//! no mutex anywhere near the callback. Stereo devices are rendered into
//! directly; wider layouts go through a pre-allocated scratch buffer with
//! the extra channels silenced.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, Stream, StreamConfig};

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::{AudioDriver, AudioSettings};
use crate::error::{AudioError, AudioResult};
use crate::render::{Renderer, RendererAdapter};

/// Largest callback we pre-allocate for
pub const MAX_BUFFER_FRAMES: usize = 8_192;

/// Keeps the audio stream alive. Drop to stop audio.
pub struct AudioHandle {
    _stream: Stream,
    sample_rate: u32,
    buffer_frames: u32,
}

impl AudioHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    /// One-way output latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_frames as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// Negotiated stream parameters, handed to the adapter factory before the
/// stream starts.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedFormat {
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub channels: u16,
}

/// Start the audio system.
///
/// `make_adapter` is called once with the negotiated format (the adapter's
/// arp clock needs the real sample rate) and the resulting adapter is
/// moved into the callback.
pub fn start_audio<R, F>(
    settings: &AudioSettings,
    shared: &Arc<crate::render::AudioShared>,
    make_adapter: F,
) -> AudioResult<AudioHandle>
where
    R: Renderer + 'static,
    F: FnOnce(NegotiatedFormat) -> RendererAdapter<R>,
{
    let host = select_host(settings.driver)?;
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::NoDefaultDevice("no default output device".to_string()))?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
    log::info!("Audio device: {}", device_name);

    let (supported, buffer_frames) = negotiate_config(&device, settings)?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate: supported.sample_rate(),
        buffer_size: BufferSize::Fixed(buffer_frames),
    };

    let period_ns = (buffer_frames as u64 * 1_000_000_000) / sample_rate as u64;
    shared.buffer_period_ns.store(period_ns, Ordering::Relaxed);
    shared.buffer_frames.store(buffer_frames, Ordering::Relaxed);

    log::info!(
        "Audio config: {} channels, {} Hz, {} frames (~{:.1} ms)",
        channels,
        sample_rate,
        buffer_frames,
        period_ns as f64 / 1e6
    );

    let adapter = make_adapter(NegotiatedFormat {
        sample_rate,
        buffer_frames,
        channels,
    });
    let stream = build_stream(&device, &stream_config, adapter)?;
    stream
        .play()
        .map_err(|err| AudioError::StreamPlayError(err.to_string()))?;

    log::info!("Audio stream started");
    Ok(AudioHandle {
        _stream: stream,
        sample_rate,
        buffer_frames,
    })
}

/// Resolve the configured driver to a CPAL host.
fn select_host(driver: AudioDriver) -> AudioResult<cpal::Host> {
    let wanted = match driver {
        // PipeWire serves the default host's compatibility layer
        AudioDriver::Auto | AudioDriver::Pipewire => return Ok(cpal::default_host()),
        AudioDriver::Alsa => "Alsa",
        AudioDriver::Jack => "Jack",
    };
    for host_id in cpal::available_hosts() {
        if format!("{:?}", host_id) == wanted {
            return cpal::host_from_id(host_id)
                .map_err(|err| AudioError::DriverUnavailable(err.to_string()));
        }
    }
    Err(AudioError::DriverUnavailable(wanted.to_string()))
}

/// Pick the best supported config: f32, stereo or wider, requested rate if
/// the device ranges allow it.
fn negotiate_config(
    device: &cpal::Device,
    settings: &AudioSettings,
) -> AudioResult<(cpal::SupportedStreamConfig, u32)> {
    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|err| AudioError::ConfigError(err.to_string()))?
        .collect();
    if supported.is_empty() {
        return Err(AudioError::ConfigError(
            "no supported output configurations".to_string(),
        ));
    }

    let target_rate = settings.sample_rate;
    let best = supported
        .iter()
        .filter(|config| config.sample_format() == SampleFormat::F32)
        .filter(|config| config.channels() >= 2)
        .find(|config| {
            target_rate >= config.min_sample_rate().0 && target_rate <= config.max_sample_rate().0
        })
        .or_else(|| supported.iter().find(|config| config.channels() >= 2))
        .or_else(|| supported.first())
        .ok_or_else(|| AudioError::ConfigError("no usable output configuration".to_string()))?;

    let rate = if target_rate >= best.min_sample_rate().0 && target_rate <= best.max_sample_rate().0
    {
        cpal::SampleRate(target_rate)
    } else {
        let fallback = best.max_sample_rate();
        log::warn!(
            "Device does not support {} Hz, falling back to {} Hz",
            target_rate,
            fallback.0
        );
        fallback
    };

    let frames = settings
        .buffer_frames
        .clamp(32, MAX_BUFFER_FRAMES as u32);
    Ok((best.clone().with_sample_rate(rate), frames))
}

fn build_stream<R: Renderer + 'static>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut adapter: RendererAdapter<R>,
) -> AudioResult<Stream> {
    let channels = config.channels as usize;
    // Scratch for non-stereo layouts, sized once up front
    let mut scratch = vec![0f32; MAX_BUFFER_FRAMES * 2];

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                if channels == 2 {
                    adapter.render(frames, data);
                    return;
                }
                if frames > MAX_BUFFER_FRAMES {
                    // Driver handed us more than we pre-allocated for
                    data.fill(0.0);
                    return;
                }
                let stereo = &mut scratch[..frames * 2];
                adapter.render(frames, stereo);
                for (frame_idx, frame) in data.chunks_mut(channels).enumerate() {
                    frame[0] = stereo[frame_idx * 2];
                    if channels > 1 {
                        frame[1] = stereo[frame_idx * 2 + 1];
                    }
                    for sample in frame.iter_mut().skip(2) {
                        *sample = 0.0;
                    }
                }
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|err| AudioError::StreamBuildError(err.to_string()))?;
    Ok(stream)
}

/// Headless clock: no audio device, the adapter is driven at the buffer
/// period from a plain thread. Inputs still produce events, the arp still
/// ticks, rendering goes nowhere.
pub fn run_headless<R: Renderer>(
    mut adapter: RendererAdapter<R>,
    format: NegotiatedFormat,
    shared: &Arc<crate::render::AudioShared>,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    let period_ns = (format.buffer_frames as u64 * 1_000_000_000) / format.sample_rate as u64;
    shared.buffer_period_ns.store(period_ns, Ordering::Relaxed);
    shared
        .buffer_frames
        .store(format.buffer_frames, Ordering::Relaxed);

    let frames = format.buffer_frames as usize;
    let mut buffer = vec![0f32; frames * 2];
    let period = std::time::Duration::from_nanos(period_ns);
    log::info!(
        "Headless mode: driving the pipeline at {} frames / {:.1} ms",
        frames,
        period_ns as f64 / 1e6
    );
    while running.load(Ordering::Relaxed) {
        adapter.render(frames, &mut buffer);
        std::thread::sleep(period);
    }
}
