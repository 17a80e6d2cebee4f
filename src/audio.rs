//! Owns the cpal output stream bound to the resolved audio backend.
//!
//! The `Engine` pairs the stream with the [`EngineHandle`] and controls
//! their teardown order: the stream is stopped and dropped before the
//! handle is marked destroyed, so the callback can never render against a
//! dying synthesizer.

use crate::config::{AudioBackend, Config};
use crate::engine::{EngineHandle, OxiBackend};
use anyhow::{Context, Result};
use cpal::{
    BufferSize, FromSample, HostId, SampleFormat, SizedSample, Stream, StreamConfig, host_from_id,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};

pub struct Engine {
    handle: EngineHandle,
    backend: AudioBackend,
    stream: Option<Stream>,
    shut_down: bool,
}

impl Engine {
    /// Brings the synthesizer up against a concrete (already resolved)
    /// backend: engine core with fonts loaded, then an output stream, then
    /// the handle flips to `Ready`. Any failure tears the partial state
    /// down via `Drop`.
    pub fn start(config: &Config, backend: AudioBackend) -> Result<Self> {
        let core = OxiBackend::new(config).context("synthesizer initialization failed")?;
        let fonts = core.fonts_loaded();
        let handle = EngineHandle::with_fonts(Box::new(core), config, fonts);

        let host = open_host(backend);
        let device = host
            .default_output_device()
            .context("no default output device")?;
        let def_cfg = device
            .default_output_config()
            .context("no default output config")?;
        let sample_format = def_cfg.sample_format();
        let mut stream_cfg: StreamConfig = def_cfg.into();
        stream_cfg.buffer_size = BufferSize::Fixed(config.buffer_size);

        let stream = match build_stream(
            &device,
            &stream_cfg,
            sample_format,
            handle.clone(),
            config.realtime_priority,
        ) {
            Ok(stream) => stream,
            Err(e) => {
                // Some ALSA devices refuse fixed buffer sizes.
                log::warn!(
                    "fixed {}-frame buffer rejected ({e:#}), retrying with device default",
                    config.buffer_size
                );
                stream_cfg.buffer_size = BufferSize::Default;
                build_stream(
                    &device,
                    &stream_cfg,
                    sample_format,
                    handle.clone(),
                    config.realtime_priority,
                )?
            }
        };
        stream.play().context("failed to start audio stream")?;

        handle.mark_ready(stream_cfg.sample_rate.0, config.buffer_size);
        log::info!(
            "audio output running: {} backend, {} Hz, {} font(s) loaded",
            backend,
            stream_cfg.sample_rate.0,
            fonts
        );

        Ok(Self {
            handle,
            backend,
            stream: Some(stream),
            shut_down: false,
        })
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    pub fn backend(&self) -> AudioBackend {
        self.backend
    }

    /// Idempotent ordered teardown: stream first, then the engine state.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.handle.mark_shutting_down();
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                log::debug!("audio stream pause failed: {e}");
            }
        }
        self.handle.mark_destroyed();
        log::info!("audio engine shut down ({} backend)", self.backend);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// cpal on Linux exposes JACK and ALSA hosts. JACK and PipeWire go through
/// the JACK host (PipeWire speaks the JACK protocol); PulseAudio and raw
/// ALSA go through the default ALSA host, which PulseAudio's compatibility
/// layer serves.
fn open_host(backend: AudioBackend) -> cpal::Host {
    match backend {
        AudioBackend::Jack | AudioBackend::PipeWire => host_from_id(HostId::Jack)
            .unwrap_or_else(|_| {
                log::warn!("JACK host unavailable, falling back to default host");
                cpal::default_host()
            }),
        _ => cpal::default_host(),
    }
}

fn build_stream(
    device: &cpal::Device,
    cfg: &StreamConfig,
    sample_format: SampleFormat,
    handle: EngineHandle,
    realtime: bool,
) -> Result<Stream> {
    match sample_format {
        SampleFormat::F32 => run_f32(device, cfg, handle, realtime),
        SampleFormat::I16 => run_generic::<i16>(device, cfg, handle, realtime),
        SampleFormat::U16 => run_generic::<u16>(device, cfg, handle, realtime),
        other => anyhow::bail!("unsupported output sample format {other:?}"),
    }
}

// ─────────────────────────── f32 fast path ─────────────────────────────── //

fn run_f32(
    device: &cpal::Device,
    cfg: &StreamConfig,
    handle: EngineHandle,
    realtime: bool,
) -> Result<Stream> {
    let channels = cfg.channels as usize;
    let mut rt_pending = realtime;

    let err_fn = |e| log::error!("audio stream error: {e}");
    let stream = device.build_output_stream(
        cfg,
        move |output: &mut [f32], _| {
            if rt_pending {
                rt_pending = false;
                request_realtime_priority();
            }
            let frames = output.len() / channels;
            let mut chunks = output.chunks_mut(channels);
            handle.render(frames, |(l, r)| {
                if let Some(frame) = chunks.next() {
                    frame[0] = l;
                    if channels > 1 {
                        frame[1] = r;
                    }
                }
            });
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

// ─────────────── generic path for I16 / U16 sample formats ─────────────── //

fn run_generic<T>(
    device: &cpal::Device,
    cfg: &StreamConfig,
    handle: EngineHandle,
    realtime: bool,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = cfg.channels as usize;
    let mut rt_pending = realtime;

    let err_fn = |e| log::error!("audio stream error: {e}");
    let stream = device.build_output_stream(
        cfg,
        move |output: &mut [T], _| {
            if rt_pending {
                rt_pending = false;
                request_realtime_priority();
            }
            let frames = output.len() / channels;
            let mut chunks = output.chunks_mut(channels);
            handle.render(frames, |(l, r)| {
                if let Some(frame) = chunks.next() {
                    frame[0] = T::from_sample(l);
                    if channels > 1 {
                        frame[1] = T::from_sample(r);
                    }
                }
            });
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Best effort; needs CAP_SYS_NICE or an rtkit-style rlimit. Failure only
/// means higher latency jitter.
fn request_realtime_priority() {
    let param = libc::sched_param { sched_priority: 50 };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc == 0 {
        log::info!("audio thread running with realtime priority");
    } else {
        log::debug!(
            "realtime scheduling unavailable: {}",
            std::io::Error::last_os_error()
        );
    }
}
