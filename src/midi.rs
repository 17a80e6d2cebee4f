//! MIDI input: the decoded event set, raw-byte decoding, and the
//! ALSA-sequencer transport.
//!
//! Every transport owns exactly one live input source and forwards decoded
//! events to the engine handle in arrival order. Engine refusals (range
//! errors, transient engine failures) are logged and dropped; only the
//! transport itself dying is fatal, surfaced through [`MidiTransport::healthy`]
//! for the supervision loop to act on.

use crate::config::{Config, MidiDriver};
use crate::engine::EngineHandle;
use anyhow::{Context, Result, anyhow};
use midir::os::unix::VirtualInput;
use midir::{Ignore, MidiInputConnection, MidiInputPort};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

const SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// The closed set of event kinds that reach the synthesizer. Everything
/// else on the wire (SysEx, clock, meta traffic) is dropped at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, key: u8, vel: u8 },
    NoteOff { channel: u8, key: u8, vel: u8 },
    ControlChange { channel: u8, ctrl: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    PitchBend { channel: u8, value: u16 },
    ChannelPressure { channel: u8, value: u8 },
    KeyPressure { channel: u8, key: u8, value: u8 },
}

/// Decodes one raw MIDI message. Returns `None` for anything outside the
/// supported set, including truncated messages.
pub fn decode_midi(msg: &[u8]) -> Option<MidiMessage> {
    if msg.is_empty() {
        return None;
    }
    let status = msg[0];
    let channel = status & 0x0F;

    match status & 0xF0 {
        0x80 if msg.len() >= 3 => Some(MidiMessage::NoteOff {
            channel,
            key: msg[1],
            vel: msg[2],
        }),
        0x90 if msg.len() >= 3 => Some(MidiMessage::NoteOn {
            channel,
            key: msg[1],
            vel: msg[2],
        }),
        0xA0 if msg.len() >= 3 => Some(MidiMessage::KeyPressure {
            channel,
            key: msg[1],
            value: msg[2],
        }),
        0xB0 if msg.len() >= 3 => Some(MidiMessage::ControlChange {
            channel,
            ctrl: msg[1],
            value: msg[2],
        }),
        0xC0 if msg.len() >= 2 => Some(MidiMessage::ProgramChange {
            channel,
            program: msg[1],
        }),
        0xD0 if msg.len() >= 2 => Some(MidiMessage::ChannelPressure {
            channel,
            value: msg[1],
        }),
        0xE0 if msg.len() >= 3 => {
            // 14-bit value, LSB first, natively biased around the 8192 center.
            let value = ((msg[2] as u16) << 7) | msg[1] as u16;
            Some(MidiMessage::PitchBend { channel, value })
        }
        _ => None,
    }
}

/// Forwards one decoded event to the engine. Refusals are logged and
/// swallowed: a single bad event must never take the input down.
pub fn forward(engine: &EngineHandle, msg: MidiMessage) {
    let result = match msg {
        MidiMessage::NoteOn { channel, key, vel } => engine.note_on(channel, key, vel),
        MidiMessage::NoteOff { channel, key, vel } => engine.note_off(channel, key, vel),
        MidiMessage::ControlChange {
            channel,
            ctrl,
            value,
        } => engine.control_change(channel, ctrl, value),
        MidiMessage::ProgramChange { channel, program } => engine.program_change(channel, program),
        MidiMessage::PitchBend { channel, value } => engine.pitch_bend(channel, value),
        MidiMessage::ChannelPressure { channel, value } => engine.channel_pressure(channel, value),
        MidiMessage::KeyPressure {
            channel,
            key,
            value,
        } => engine.key_pressure(channel, key, value),
    };
    if let Err(e) = result {
        log::debug!("dropped {msg:?}: {e}");
    }
}

/// One live MIDI input source. Immutable transport choice; panic and
/// shutdown must be safe at any time after construction, concurrently with
/// event delivery.
pub trait MidiTransport: Send {
    fn name(&self) -> &'static str;
    /// Silence everything now. The sequencer variant also tears down its
    /// source subscriptions.
    fn panic(&mut self);
    /// False once the transport itself broke (service died). The
    /// supervision loop treats that as cause for daemon shutdown.
    fn healthy(&self) -> bool;
    /// Idempotent; must not hang on the receive side.
    fn shutdown(&mut self);
}

pub fn open_transport(config: &Config, engine: EngineHandle) -> Result<Box<dyn MidiTransport>> {
    match config.midi_driver {
        MidiDriver::Seq => Ok(Box::new(SequencerTransport::start(config, engine)?)),
        MidiDriver::Jack => Ok(Box::new(crate::midi_jack::RawPortTransport::start(
            config, engine,
        )?)),
    }
}

// ───────────────────── ALSA sequencer transport (midir) ────────────────── //

enum ScanCommand {
    DisconnectAll,
    Stop,
}

struct ScanThread {
    tx: Sender<ScanCommand>,
    handle: thread::JoinHandle<()>,
}

/// Sequencer-style transport: one named virtual input port other clients
/// can subscribe to (the `aconnect` workflow), plus an optional scan thread
/// that attaches and detaches hardware sources as they come and go.
pub struct SequencerTransport {
    engine: EngineHandle,
    virtual_port: Option<MidiInputConnection<()>>,
    scan: Option<ScanThread>,
    healthy: Arc<AtomicBool>,
    shut_down: bool,
}

impl SequencerTransport {
    pub fn start(config: &Config, engine: EngineHandle) -> Result<Self> {
        let mut midi_in = midir::MidiInput::new(&config.client_name)
            .context("ALSA sequencer unavailable")?;
        midi_in.ignore(Ignore::None);

        let port_engine = engine.clone();
        let virtual_port = midi_in
            .create_virtual(
                "midi_in",
                move |_stamp, bytes, _| {
                    if let Some(msg) = decode_midi(bytes) {
                        forward(&port_engine, msg);
                    }
                },
                (),
            )
            .map_err(|e| anyhow!("failed to create sequencer input port: {e}"))?;
        log::info!(
            "sequencer client '{}' ready, connect sources with: aconnect <source> '{}'",
            config.client_name,
            config.client_name
        );

        let healthy = Arc::new(AtomicBool::new(true));
        let scan = config.midi_autoconnect.then(|| {
            spawn_scan_thread(
                config.client_name.clone(),
                engine.clone(),
                Arc::clone(&healthy),
            )
        });

        Ok(Self {
            engine,
            virtual_port: Some(virtual_port),
            scan,
            healthy,
            shut_down: false,
        })
    }
}

impl MidiTransport for SequencerTransport {
    fn name(&self) -> &'static str {
        "seq"
    }

    fn panic(&mut self) {
        log::warn!("MIDI panic requested, silencing all channels");
        if let Some(scan) = &self.scan {
            let _ = scan.tx.send(ScanCommand::DisconnectAll);
        }
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
        if let Some(scan) = self.scan.take() {
            let _ = scan.tx.send(ScanCommand::Stop);
            if scan.handle.join().is_err() {
                log::warn!("MIDI scan thread panicked during shutdown");
            }
        }
        if let Some(port) = self.virtual_port.take() {
            port.close();
        }
        log::info!("sequencer MIDI input shut down");
    }
}

impl Drop for SequencerTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps source connections in sync with the devices currently present.
/// Stopped through the command channel, so shutdown never waits out a scan
/// sleep.
fn spawn_scan_thread(
    client_name: String,
    engine: EngineHandle,
    healthy: Arc<AtomicBool>,
) -> ScanThread {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let mut links: HashMap<String, SourceLink> = HashMap::new();
        let mut failures = 0u32;

        loop {
            // Fresh client each pass so the port list is current.
            match midir::MidiInput::new(&format!("{client_name}-scan")) {
                Ok(inp) => {
                    failures = 0;
                    let mut present = HashSet::new();
                    for port in inp.ports() {
                        let Ok(name) = inp.port_name(&port) else {
                            continue;
                        };
                        if !is_hardware_source(&name, &client_name) {
                            continue;
                        }
                        present.insert(name.clone());
                        if !links.contains_key(&name) {
                            match SourceLink::connect(&client_name, &port, engine.clone()) {
                                Ok(link) => {
                                    log::info!("🎹 connected MIDI source {name}");
                                    links.insert(name, link);
                                }
                                Err(e) => log::warn!("failed to connect to {name}: {e:#}"),
                            }
                        }
                    }
                    links.retain(|name, _| {
                        if present.contains(name) {
                            true
                        } else {
                            log::info!("🎹 disconnected {name}");
                            false
                        }
                    });
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("sequencer scan failed ({failures}): {e}");
                    if failures >= 3 {
                        log::error!("sequencer service lost, marking MIDI input failed");
                        healthy.store(false, Ordering::Release);
                        return;
                    }
                }
            }

            // Wait out the interval; commands wake the thread immediately.
            // A disconnect keeps waiting so sources are not re-subscribed in
            // the same breath.
            loop {
                match rx.recv_timeout(SCAN_INTERVAL) {
                    Ok(ScanCommand::DisconnectAll) => {
                        log::info!("dropping {} MIDI source subscription(s)", links.len());
                        links.clear();
                    }
                    Ok(ScanCommand::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => break,
                }
            }
        }
    });
    ScanThread { tx, handle }
}

/// Connection to one upstream source. Dropping it closes the subscription.
struct SourceLink {
    _conn: MidiInputConnection<()>,
}

impl SourceLink {
    fn connect(client_name: &str, port: &MidiInputPort, engine: EngineHandle) -> Result<Self> {
        let mut midi_in = midir::MidiInput::new(client_name)?;
        midi_in.ignore(Ignore::None);

        let name = midi_in.port_name(port)?;
        let conn = midi_in
            .connect(
                port,
                "source-in",
                move |_stamp, bytes, _| {
                    if let Some(msg) = decode_midi(bytes) {
                        forward(&engine, msg);
                    }
                },
                (),
            )
            .map_err(|e| anyhow!("connect {name}: {e}"))?;
        Ok(Self { _conn: conn })
    }
}

/// Only subscribe to sources that look like physical devices. Our own
/// client, through ports, and known software synthesizers are skipped so a
/// software client can never loop our own output back in.
fn is_hardware_source(port_name: &str, own_client: &str) -> bool {
    let lower = port_name.to_lowercase();
    if lower.contains(&own_client.to_lowercase()) {
        return false;
    }
    const SOFTWARE: &[&str] = &[
        "midi through",
        "through port",
        "virmidi",
        "virtual",
        "fluid",
        "timidity",
        "qsynth",
    ];
    !SOFTWARE.iter().any(|pat| lower.contains(pat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{Call, ready_handle};

    #[test]
    fn decodes_channel_voice_messages() {
        assert_eq!(
            decode_midi(&[0x90, 60, 100]),
            Some(MidiMessage::NoteOn {
                channel: 0,
                key: 60,
                vel: 100
            })
        );
        assert_eq!(
            decode_midi(&[0x83, 60, 0]),
            Some(MidiMessage::NoteOff {
                channel: 3,
                key: 60,
                vel: 0
            })
        );
        assert_eq!(
            decode_midi(&[0xB5, 64, 127]),
            Some(MidiMessage::ControlChange {
                channel: 5,
                ctrl: 64,
                value: 127
            })
        );
        assert_eq!(
            decode_midi(&[0xC9, 42]),
            Some(MidiMessage::ProgramChange {
                channel: 9,
                program: 42
            })
        );
        assert_eq!(
            decode_midi(&[0xD1, 99]),
            Some(MidiMessage::ChannelPressure {
                channel: 1,
                value: 99
            })
        );
        assert_eq!(
            decode_midi(&[0xA2, 60, 80]),
            Some(MidiMessage::KeyPressure {
                channel: 2,
                key: 60,
                value: 80
            })
        );
    }

    #[test]
    fn pitch_bend_is_assembled_from_both_payload_bytes() {
        // Center: LSB 0x00, MSB 0x40 → 8192.
        assert_eq!(
            decode_midi(&[0xE0, 0x00, 0x40]),
            Some(MidiMessage::PitchBend {
                channel: 0,
                value: 8_192
            })
        );
        // Extremes.
        assert_eq!(
            decode_midi(&[0xE7, 0x00, 0x00]),
            Some(MidiMessage::PitchBend {
                channel: 7,
                value: 0
            })
        );
        assert_eq!(
            decode_midi(&[0xE7, 0x7F, 0x7F]),
            Some(MidiMessage::PitchBend {
                channel: 7,
                value: 16_383
            })
        );
    }

    #[test]
    fn unsupported_and_truncated_messages_are_dropped() {
        assert_eq!(decode_midi(&[]), None);
        assert_eq!(decode_midi(&[0xF0, 0x01, 0xF7]), None); // SysEx
        assert_eq!(decode_midi(&[0xF8]), None); // clock
        assert_eq!(decode_midi(&[0x90, 60]), None); // truncated note-on
        assert_eq!(decode_midi(&[0xE0, 0x10]), None); // truncated bend
    }

    #[test]
    fn events_reach_the_engine_in_arrival_order() {
        let (engine, calls) = ready_handle();
        for bytes in [&[0x90u8, 60, 100][..], &[0x80, 60, 0][..]] {
            if let Some(msg) = decode_midi(bytes) {
                forward(&engine, msg);
            }
        }
        assert_eq!(
            *calls.lock(),
            vec![Call::NoteOn(0, 60, 100), Call::NoteOff(0, 60)]
        );
    }

    #[test]
    fn forward_swallows_engine_refusals() {
        let (engine, calls) = ready_handle();
        // Channel nibble caps at 15, so an out-of-range channel cannot come
        // from decode; feed the engine a synthetic bad value directly.
        forward(
            &engine,
            MidiMessage::NoteOn {
                channel: 16,
                key: 60,
                vel: 100,
            },
        );
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn hardware_source_filter_rejects_loopback_candidates() {
        assert!(is_hardware_source("USB Midi Keyboard 24:0", "synthd"));
        assert!(is_hardware_source("Arturia KeyStep 32 28:0", "synthd"));
        assert!(!is_hardware_source("Midi Through Port-0 14:0", "synthd"));
        assert!(!is_hardware_source("synthd:midi_in 128:0", "synthd"));
        assert!(!is_hardware_source("FLUID Synth (qsynth) 129:0", "synthd"));
        assert!(!is_hardware_source("VirMIDI 2-0 20:0", "synthd"));
    }
}
