//! Top-level lifecycle: signal bridge, fixed startup ordering, the
//! supervision loop, reload isolation, and reverse-order teardown.
//!
//! Control surface: SIGTERM/SIGINT request shutdown, SIGHUP a configuration
//! reload, SIGUSR1 a status report, SIGUSR2 a MIDI panic. Handlers only flip
//! atomic flags; every reaction happens on the supervision thread.

use crate::audio::Engine;
use crate::config::{Config, ConfigSource};
use crate::driver::{self, ProbeReport};
use crate::engine::EngineHandle;
use crate::midi::{MidiTransport, open_transport};
use crate::privs;
use anyhow::{Context, Result, bail};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct SignalFlags {
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    status: Arc<AtomicBool>,
    panic: Arc<AtomicBool>,
}

impl SignalFlags {
    fn install() -> Result<Self> {
        let flags = Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
            status: Arc::new(AtomicBool::new(false)),
            panic: Arc::new(AtomicBool::new(false)),
        };
        signal_hook::flag::register(SIGTERM, Arc::clone(&flags.shutdown))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&flags.shutdown))?;
        signal_hook::flag::register(SIGHUP, Arc::clone(&flags.reload))?;
        signal_hook::flag::register(SIGUSR1, Arc::clone(&flags.status))?;
        signal_hook::flag::register(SIGUSR2, Arc::clone(&flags.panic))?;
        Ok(flags)
    }

    fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::AcqRel)
    }
}

/// Runs the daemon to completion. Startup order is fixed: resolve the
/// backend, bring up the engine, then the MIDI transport against it, then
/// shed privileges. Teardown always runs in reverse.
pub fn run(mut config: Config, source: ConfigSource) -> Result<()> {
    let flags = SignalFlags::install().context("failed to install signal handlers")?;

    let backend = driver::resolve(config.audio_backend, &ProbeReport::gather());

    let (mut engine, mut midi) = start_pair(
        || Engine::start(&config, backend),
        |engine: &Engine| open_transport(&config, engine.handle().clone()),
    )
    .context("daemon startup failed")?;

    if let Err(e) = engine.handle().reset_controllers() {
        log::warn!("startup controller reset failed: {e}");
    }

    // Everything that needed elevated rights is acquired; shed them before
    // steady-state input processing.
    if let Err(e) = privs::drop_privileges(config.user.as_deref(), config.group.as_deref()) {
        midi.shutdown();
        engine.shutdown();
        return Err(e.context("privilege drop failed"));
    }

    notify_ready();
    log::info!(
        "synthd running: {} backend, {} MIDI input, client '{}'",
        engine.backend(),
        midi.name(),
        config.client_name
    );

    let outcome = supervise(
        &flags,
        &mut config,
        &source,
        engine.handle().clone(),
        midi.as_mut(),
    );

    notify_stopping();
    // Reverse of construction: the transport must be gone before the engine
    // it forwards into.
    midi.shutdown();
    drop(midi);
    engine.shutdown();
    log::info!("synthd stopped");
    outcome
}

/// Constructs the engine, then the MIDI transport bound to it. When the
/// transport fails, the engine that was already constructed is dropped
/// (its teardown runs exactly once) before the error propagates; a MIDI
/// adapter that was never constructed is never torn down.
fn start_pair<E, M>(
    engine: impl FnOnce() -> Result<E>,
    midi: impl FnOnce(&E) -> Result<M>,
) -> Result<(E, M)> {
    let engine = engine()?;
    match midi(&engine) {
        Ok(midi) => Ok((engine, midi)),
        Err(e) => {
            drop(engine);
            Err(e)
        }
    }
}

/// Steady state: a bounded sleep per iteration, flags handled in between.
/// MIDI delivery runs on the transports' own receive threads; this loop
/// only supervises.
fn supervise(
    flags: &SignalFlags,
    config: &mut Config,
    source: &ConfigSource,
    engine: EngineHandle,
    midi: &mut dyn MidiTransport,
) -> Result<()> {
    while !flags.shutdown.load(Ordering::Acquire) {
        if SignalFlags::take(&flags.reload) {
            reload(config, source, &engine);
        }
        if SignalFlags::take(&flags.status) {
            log_status(&engine);
        }
        if SignalFlags::take(&flags.panic) {
            midi.panic();
        }
        if !midi.healthy() {
            bail!("MIDI transport failed, shutting down");
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    log::info!("termination requested, leaving supervision loop");
    Ok(())
}

/// Loads and validates a fresh configuration in isolation. On any failure
/// the active configuration and the running engine stay exactly as they
/// were; on success only the runtime-mutable subset is adopted.
fn reload(active: &mut Config, source: &ConfigSource, engine: &EngineHandle) {
    log::info!("reloading configuration");
    let mut incoming = match Config::load(source) {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration reload failed, keeping current settings: {e}");
            return;
        }
    };
    let repairs = incoming.validate();
    if repairs > 0 {
        log::warn!("reload repaired {repairs} invalid value(s)");
    }

    let mut candidate = active.clone();
    candidate.apply_runtime(&incoming);
    if let Err(e) = engine.update_settings(&candidate) {
        log::error!("could not apply reloaded settings, keeping current: {e}");
        return;
    }
    if candidate.log_level != active.log_level {
        log::set_max_level(candidate.log_level.to_filter());
    }
    *active = candidate;
    log::info!("configuration reloaded");
}

fn log_status(engine: &EngineHandle) {
    let status = engine.status();
    log::info!(
        "status: {:?}, {}/{} notes, {:.1}% engine load, {} font(s), {} Hz, {}-frame buffer",
        status.state,
        status.active_notes,
        status.polyphony,
        status.cpu_load,
        status.fonts_loaded,
        status.sample_rate,
        status.buffer_size
    );
}

#[cfg(feature = "systemd")]
fn notify_ready() {
    // No-op outside a systemd unit (NOTIFY_SOCKET unset).
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        log::debug!("systemd readiness notification failed: {e}");
    }
}

#[cfg(feature = "systemd")]
fn notify_stopping() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]) {
        log::debug!("systemd stop notification failed: {e}");
    }
}

#[cfg(not(feature = "systemd"))]
fn notify_ready() {}

#[cfg(not(feature = "systemd"))]
fn notify_stopping() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{Call, ready_handle};
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    struct DropCounter {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn midi_failure_tears_down_engine_exactly_once() {
        let engine_drops = Arc::new(AtomicUsize::new(0));
        let drops = Arc::clone(&engine_drops);

        let result = start_pair(
            move || {
                Ok(DropCounter { drops })
            },
            |_engine| -> Result<DropCounter> { bail!("transport refused to open") },
        );
        assert!(result.is_err());
        assert_eq!(engine_drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn engine_failure_never_constructs_midi() {
        let midi_constructed = Arc::new(AtomicBool::new(false));
        let constructed = Arc::clone(&midi_constructed);

        let result = start_pair(
            || -> Result<()> { bail!("no audio backend") },
            move |_engine| {
                constructed.store(true, Ordering::SeqCst);
                Ok(())
            },
        );
        assert!(result.is_err());
        assert!(!midi_constructed.load(Ordering::SeqCst));
    }

    #[test]
    fn successful_startup_hands_both_components_back() {
        let engine_drops = Arc::new(AtomicUsize::new(0));
        let drops = Arc::clone(&engine_drops);

        let pair = start_pair(move || Ok(DropCounter { drops }), |_engine| Ok("midi"))
            .expect("startup should succeed");
        assert_eq!(engine_drops.load(Ordering::SeqCst), 0);
        drop(pair);
        assert_eq!(engine_drops.load(Ordering::SeqCst), 1);
    }

    struct MockTransport {
        panics: usize,
        healthy: bool,
    }

    impl MidiTransport for MockTransport {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn panic(&mut self) {
            self.panics += 1;
        }

        fn healthy(&self) -> bool {
            self.healthy
        }

        fn shutdown(&mut self) {}
    }

    /// Flags without real signal handlers behind them, so tests poke them
    /// directly.
    fn test_flags() -> SignalFlags {
        SignalFlags {
            shutdown: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
            status: Arc::new(AtomicBool::new(false)),
            panic: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn supervision_exits_cleanly_on_termination_request() {
        let (engine, _calls) = ready_handle();
        let mut config = Config::default();
        let flags = test_flags();
        flags.shutdown.store(true, Ordering::Release);

        let mut midi = MockTransport {
            panics: 0,
            healthy: true,
        };
        let result = supervise(
            &flags,
            &mut config,
            &ConfigSource::Standard,
            engine,
            &mut midi,
        );
        assert!(result.is_ok());
        assert_eq!(midi.panics, 0);
    }

    #[test]
    fn transport_failure_stops_the_loop_with_an_error() {
        let (engine, _calls) = ready_handle();
        let mut config = Config::default();
        let flags = test_flags();

        let mut midi = MockTransport {
            panics: 0,
            healthy: false,
        };
        let result = supervise(
            &flags,
            &mut config,
            &ConfigSource::Standard,
            engine,
            &mut midi,
        );
        assert!(result.is_err());
    }

    #[test]
    fn panic_flag_reaches_the_transport() {
        let (engine, _calls) = ready_handle();
        let mut config = Config::default();
        let flags = test_flags();
        flags.panic.store(true, Ordering::Release);

        // The failed transport ends the iteration right after the panic is
        // handled, so the loop terminates without a second pass.
        let mut midi = MockTransport {
            panics: 0,
            healthy: false,
        };
        let result = supervise(
            &flags,
            &mut config,
            &ConfigSource::Standard,
            engine,
            &mut midi,
        );
        assert!(result.is_err());
        assert_eq!(midi.panics, 1);
    }

    fn temp_config(contents: &str) -> (tempfile::NamedTempFile, ConfigSource) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let source = ConfigSource::Explicit(PathBuf::from(file.path()));
        (file, source)
    }

    #[test]
    fn reload_failure_keeps_active_config_and_engine_untouched() {
        let (engine, calls) = ready_handle();
        let mut active = Config::default();
        let before = active.clone();

        let (_file, source) = temp_config("gain: [definitely not yaml\n");
        reload(&mut active, &source, &engine);

        assert_eq!(active, before);
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn reload_from_missing_file_is_isolated_too() {
        let (engine, calls) = ready_handle();
        let mut active = Config::default();
        let before = active.clone();

        let source = ConfigSource::Explicit(PathBuf::from("/nonexistent/synthd.yaml"));
        reload(&mut active, &source, &engine);

        assert_eq!(active, before);
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn reload_applies_only_the_runtime_subset() {
        let (engine, calls) = ready_handle();
        let mut active = Config::default();

        let (_file, source) =
            temp_config("gain: 1.5\nsample_rate: 96000\nchorus:\n  enabled: false\n");
        reload(&mut active, &source, &engine);

        assert_eq!(active.gain, 1.5);
        assert!(!active.chorus.enabled);
        // Restart-only values are not adopted on reload.
        assert_eq!(active.sample_rate, crate::config::DEFAULT_SAMPLE_RATE);

        let recorded = calls.lock().clone();
        assert!(recorded.contains(&Call::Gain(1.5)));
        assert!(
            recorded
                .iter()
                .any(|c| matches!(c, Call::Chorus(false, _)))
        );
    }
}
