//! Decides, once at startup, which audio backend the engine targets.
//!
//! Probing is split from resolution so `resolve` stays a pure function of
//! (requested backend, probe report) and can be tested with fake reports.

use crate::config::AudioBackend;
use jack::{Client, ClientOptions};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Snapshot of which audio servers answered their existence checks.
/// ALSA needs no probe: raw hardware access is always considered available
/// and terminates the search.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeReport {
    pub jack: bool,
    pub pipewire: bool,
    pub pulseaudio: bool,
}

impl ProbeReport {
    /// Runs the real environment probes. Each check is cheap and bounded:
    /// a unix-socket poke or a runtime-file existence test, never a wait.
    pub fn gather() -> Self {
        let report = Self {
            jack: jack_available(),
            pipewire: pipewire_available(),
            pulseaudio: pulseaudio_available(),
        };
        log::debug!("audio server probe: {report:?}");
        report
    }
}

/// Resolves the requested backend against the probe report. An explicit
/// (non-auto) request is returned unchanged; the user's choice is never
/// second-guessed. `auto` walks the priority order JACK → PipeWire →
/// PulseAudio and falls back to ALSA, so the result is always concrete.
pub fn resolve(requested: AudioBackend, report: &ProbeReport) -> AudioBackend {
    match requested {
        AudioBackend::Auto => {
            if report.jack {
                log::info!("detected JACK audio server");
                AudioBackend::Jack
            } else if report.pipewire {
                log::info!("detected PipeWire audio server");
                AudioBackend::PipeWire
            } else if report.pulseaudio {
                log::info!("detected PulseAudio server");
                AudioBackend::PulseAudio
            } else {
                log::info!("no audio server detected, falling back to ALSA");
                AudioBackend::Alsa
            }
        }
        concrete => {
            log::info!("using configured audio backend: {concrete}");
            concrete
        }
    }
}

fn runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(format!("/run/user/{}", unsafe { libc::getuid() })),
    }
}

/// The JACK server answers on a control socket under its server directory.
/// A failed socket poke falls back to a throw-away client probe that never
/// starts a server of its own.
fn jack_available() -> bool {
    let server_dir = std::env::var_os("JACK_SERVER_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/dev/shm"));
    let socket = server_dir
        .join(format!("jack-{}", unsafe { libc::getuid() }))
        .join("default");
    if UnixStream::connect(&socket).is_ok() {
        return true;
    }
    Client::new("synthd-probe", ClientOptions::NO_START_SERVER).is_ok()
}

fn pipewire_available() -> bool {
    runtime_dir().join("pipewire-0").exists()
}

fn pulseaudio_available() -> bool {
    let native = runtime_dir().join("pulse/native");
    if native.exists() {
        return true;
    }
    // System-wide daemon socket, for headless setups.
    Path::new("/var/run/pulse/native").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_prefers_jack() {
        let report = ProbeReport {
            jack: true,
            pipewire: true,
            pulseaudio: true,
        };
        assert_eq!(resolve(AudioBackend::Auto, &report), AudioBackend::Jack);
    }

    #[test]
    fn auto_walks_the_priority_order() {
        let report = ProbeReport {
            jack: false,
            pipewire: true,
            pulseaudio: true,
        };
        assert_eq!(resolve(AudioBackend::Auto, &report), AudioBackend::PipeWire);

        let report = ProbeReport {
            jack: false,
            pipewire: false,
            pulseaudio: true,
        };
        assert_eq!(
            resolve(AudioBackend::Auto, &report),
            AudioBackend::PulseAudio
        );
    }

    #[test]
    fn auto_falls_back_to_alsa_when_nothing_answers() {
        assert_eq!(
            resolve(AudioBackend::Auto, &ProbeReport::default()),
            AudioBackend::Alsa
        );
    }

    #[test]
    fn explicit_choice_is_never_second_guessed() {
        // Even with the JACK probe down, an explicit request wins.
        assert_eq!(
            resolve(AudioBackend::Jack, &ProbeReport::default()),
            AudioBackend::Jack
        );
        assert_eq!(
            resolve(AudioBackend::Alsa, &ProbeReport::default()),
            AudioBackend::Alsa
        );
    }

    #[test]
    fn resolution_is_always_concrete() {
        let all = [
            ProbeReport::default(),
            ProbeReport {
                jack: true,
                pipewire: false,
                pulseaudio: false,
            },
        ];
        for report in all {
            assert_ne!(resolve(AudioBackend::Auto, &report), AudioBackend::Auto);
        }
    }
}
