//! Raw-port MIDI input over JACK: one input port receiving timestamped
//! byte buffers, decoded in the process callback and forwarded straight to
//! the engine handle.

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::midi::{MidiTransport, decode_midi, forward};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

struct Process {
    port: jack::Port<jack::MidiIn>,
    engine: EngineHandle,
}

impl jack::ProcessHandler for Process {
    fn process(&mut self, _: &jack::Client, ps: &jack::ProcessScope) -> jack::Control {
        for event in self.port.iter(ps) {
            if let Some(msg) = decode_midi(event.bytes) {
                forward(&self.engine, msg);
            }
        }
        jack::Control::Continue
    }
}

struct Notifications {
    healthy: Arc<AtomicBool>,
}

impl jack::NotificationHandler for Notifications {
    // Flag only; the supervision loop decides what to do about it.
    unsafe fn shutdown(&mut self, _status: jack::ClientStatus, _reason: &str) {
        self.healthy.store(false, Ordering::Release);
    }
}

pub struct RawPortTransport {
    engine: EngineHandle,
    active: Option<jack::AsyncClient<Notifications, Process>>,
    healthy: Arc<AtomicBool>,
    shut_down: bool,
}

impl RawPortTransport {
    pub fn start(config: &Config, engine: EngineHandle) -> Result<Self> {
        let (client, _status) =
            jack::Client::new(&config.client_name, jack::ClientOptions::NO_START_SERVER)
                .context("failed to open JACK client (is the server running?)")?;
        let port = client
            .register_port("midi_in", jack::MidiIn::default())
            .context("failed to register JACK MIDI input port")?;
        let own_port = port.name().context("JACK input port has no name")?;

        let healthy = Arc::new(AtomicBool::new(true));
        let active = client
            .activate_async(
                Notifications {
                    healthy: Arc::clone(&healthy),
                },
                Process {
                    port,
                    engine: engine.clone(),
                },
            )
            .context("failed to activate JACK client")?;

        if config.midi_autoconnect {
            // Physical MIDI sources only; software clients could loop our
            // own output back in.
            let sources = active.as_client().ports(
                None,
                Some("midi"),
                jack::PortFlags::IS_OUTPUT | jack::PortFlags::IS_PHYSICAL,
            );
            for source in sources {
                match active.as_client().connect_ports_by_name(&source, &own_port) {
                    Ok(()) => log::info!("🎹 connected MIDI source {source}"),
                    Err(e) => log::warn!("failed to connect {source}: {e}"),
                }
            }
        }
        log::info!("JACK MIDI input port '{own_port}' ready");

        Ok(Self {
            engine,
            active: Some(active),
            healthy,
            shut_down: false,
        })
    }
}

impl MidiTransport for RawPortTransport {
    fn name(&self) -> &'static str {
        "jack"
    }

    fn panic(&mut self) {
        log::warn!("MIDI panic requested, silencing all channels");
        if let Err(e) = self.engine.all_notes_off() {
            log::warn!("panic all-notes-off failed: {e}");
        }
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if let Some(active) = self.active.take() {
            if let Err(e) = active.deactivate() {
                log::warn!("JACK deactivate failed: {e}");
            }
        }
        log::info!("JACK MIDI input shut down");
    }
}

impl Drop for RawPortTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
