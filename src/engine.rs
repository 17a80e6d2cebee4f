//! Owns the OxiSynth instance and translates discrete MIDI-level operations
//! into engine calls.
//!
//! The engine is reached through the narrow [`SynthBackend`] seam so the
//! adapter logic (range validation, state machine, reset semantics) is
//! testable against a recording mock. The [`EngineHandle`] is the
//! serialization boundary: every mutating call goes through one lock, so a
//! panic request racing live note events can never interleave inside the
//! engine.

use crate::config::{Config, SOUNDFONT_SEARCH_PATHS};
use anyhow::{Context, Result, anyhow};
use oxisynth::{ChorusParams, MidiEvent, ReverbParams, SoundFont, Synth, SynthDescriptor};
use parking_lot::Mutex;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

pub const MIDI_CHANNELS: u8 = 16;
/// GM percussion channel: program changes are meaningless there and reset
/// must leave it alone.
pub const PERCUSSION_CHANNEL: u8 = 9;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum EngineError {
    /// A MIDI argument was outside its legal range. Rejected before any
    /// engine call; never fatal.
    #[error("{param} {value} out of range (max {max})")]
    OutOfRange {
        param: &'static str,
        value: i64,
        max: i64,
    },
    /// The engine is not in a state that accepts operations.
    #[error("engine is not ready")]
    NotReady,
    /// A single engine call failed against an otherwise healthy engine.
    /// Logged and skipped; the daemon keeps running.
    #[error("engine call failed: {0}")]
    Backend(String),
}

/// Narrow seam over the synthesis engine. Production uses OxiSynth; tests
/// inject a recording mock.
///
/// Thread model: every method is called with the adapter lock held, from
/// the MIDI receive thread, the control thread, or the audio callback.
pub trait SynthBackend: Send {
    fn note_on(&mut self, channel: u8, key: u8, vel: u8) -> Result<(), EngineError>;
    fn note_off(&mut self, channel: u8, key: u8) -> Result<(), EngineError>;
    fn control_change(&mut self, channel: u8, ctrl: u8, value: u8) -> Result<(), EngineError>;
    fn program_change(&mut self, channel: u8, program: u8) -> Result<(), EngineError>;
    fn pitch_bend(&mut self, channel: u8, value: u16) -> Result<(), EngineError>;
    fn channel_pressure(&mut self, channel: u8, value: u8) -> Result<(), EngineError>;
    fn key_pressure(&mut self, channel: u8, key: u8, value: u8) -> Result<(), EngineError>;
    fn all_notes_off(&mut self, channel: u8) -> Result<(), EngineError>;
    fn all_sound_off(&mut self, channel: u8) -> Result<(), EngineError>;
    fn set_gain(&mut self, gain: f32);
    fn gain(&self) -> f32;
    fn set_chorus(&mut self, enabled: bool, level: f32);
    fn set_reverb(&mut self, enabled: bool, level: f32);
    fn set_sample_rate(&mut self, sample_rate: f32);
    fn polyphony(&self) -> u32;
    fn read_next(&mut self) -> (f32, f32);
}

// ─────────────────────────── OxiSynth backend ──────────────────────────── //

pub struct OxiBackend {
    synth: Synth,
    fonts_loaded: usize,
}

impl OxiBackend {
    pub fn new(config: &Config) -> Result<Self> {
        // The effect units stay constructed for the life of the synth; a
        // disabled effect is driven at zero level, since the engine offers
        // no runtime bypass without rebuilding the instance.
        let desc = SynthDescriptor {
            sample_rate: config.sample_rate as f32,
            gain: config.gain,
            polyphony: config.polyphony,
            reverb_active: true,
            chorus_active: true,
            ..Default::default()
        };
        let mut synth = Synth::new(desc).map_err(|e| anyhow!("synth init: {e:?}"))?;

        apply_chorus(&mut synth, config.chorus.enabled, config.chorus.level);
        apply_reverb(&mut synth, config.reverb.enabled, config.reverb.level);

        let fonts_loaded = load_soundfonts(&mut synth, config)?;
        Ok(Self {
            synth,
            fonts_loaded,
        })
    }

    pub fn fonts_loaded(&self) -> usize {
        self.fonts_loaded
    }

    fn send(&mut self, event: MidiEvent) -> Result<(), EngineError> {
        self.synth
            .send_event(event)
            .map_err(|e| EngineError::Backend(e.to_string()))
    }
}

/// Chorus shape beyond the level (voice count, speed, depth, waveform) is
/// the engine's stock sine configuration, supplied on every update.
fn apply_chorus(synth: &mut Synth, enabled: bool, level: f32) {
    let level = if enabled { level } else { 0.0 };
    synth.set_chorus_params(&ChorusParams {
        level,
        ..Default::default()
    });
}

/// Reverb room size, damping and width are likewise fixed; only the level
/// is configuration-driven.
fn apply_reverb(synth: &mut Synth, enabled: bool, level: f32) {
    let level = if enabled { level } else { 0.0 };
    synth.set_reverb_params(&ReverbParams {
        level,
        ..Default::default()
    });
}

impl SynthBackend for OxiBackend {
    fn note_on(&mut self, channel: u8, key: u8, vel: u8) -> Result<(), EngineError> {
        self.send(MidiEvent::NoteOn { channel, key, vel })
    }

    fn note_off(&mut self, channel: u8, key: u8) -> Result<(), EngineError> {
        self.send(MidiEvent::NoteOff { channel, key })
    }

    fn control_change(&mut self, channel: u8, ctrl: u8, value: u8) -> Result<(), EngineError> {
        self.send(MidiEvent::ControlChange {
            channel,
            ctrl,
            value,
        })
    }

    fn program_change(&mut self, channel: u8, program: u8) -> Result<(), EngineError> {
        self.send(MidiEvent::ProgramChange {
            channel,
            program_id: program,
        })
    }

    fn pitch_bend(&mut self, channel: u8, value: u16) -> Result<(), EngineError> {
        self.send(MidiEvent::PitchBend { channel, value })
    }

    fn channel_pressure(&mut self, channel: u8, value: u8) -> Result<(), EngineError> {
        self.send(MidiEvent::ChannelPressure { channel, value })
    }

    fn key_pressure(&mut self, channel: u8, key: u8, value: u8) -> Result<(), EngineError> {
        self.send(MidiEvent::PolyphonicKeyPressure {
            channel,
            key,
            value,
        })
    }

    fn all_notes_off(&mut self, channel: u8) -> Result<(), EngineError> {
        self.send(MidiEvent::AllNotesOff { channel })
    }

    fn all_sound_off(&mut self, channel: u8) -> Result<(), EngineError> {
        self.send(MidiEvent::AllSoundOff { channel })
    }

    fn set_gain(&mut self, gain: f32) {
        self.synth.set_gain(gain);
    }

    fn gain(&self) -> f32 {
        self.synth.gain()
    }

    fn set_chorus(&mut self, enabled: bool, level: f32) {
        apply_chorus(&mut self.synth, enabled, level);
    }

    fn set_reverb(&mut self, enabled: bool, level: f32) {
        apply_reverb(&mut self.synth, enabled, level);
    }

    fn set_sample_rate(&mut self, sample_rate: f32) {
        self.synth.set_sample_rate(sample_rate);
    }

    fn polyphony(&self) -> u32 {
        self.synth.polyphony()
    }

    fn read_next(&mut self) -> (f32, f32) {
        self.synth.read_next()
    }
}

/// Loads the configured soundfonts; falls back to the default search paths
/// when none of them yields anything. The daemon cannot run with zero sound
/// sources, so an empty result is a hard error.
fn load_soundfonts(synth: &mut Synth, config: &Config) -> Result<usize> {
    let mut loaded = 0;
    for sf in config.soundfonts.iter().filter(|sf| sf.enabled) {
        match load_font(synth, &sf.path) {
            Ok(id) => {
                log::info!("loaded soundfont {}", sf.path.display());
                if sf.bank_offset != 0 {
                    synth.set_bank_offset(id, sf.bank_offset);
                    log::debug!(
                        "bank offset {} applied to {}",
                        sf.bank_offset,
                        sf.path.display()
                    );
                }
                loaded += 1;
            }
            Err(e) => log::warn!("skipping soundfont {}: {e:#}", sf.path.display()),
        }
    }

    if loaded == 0 {
        for path in SOUNDFONT_SEARCH_PATHS {
            let path = Path::new(path);
            if !path.is_file() {
                continue;
            }
            match load_font(synth, path) {
                Ok(_) => {
                    log::info!("loaded default soundfont {}", path.display());
                    loaded += 1;
                    break;
                }
                Err(e) => log::warn!("default soundfont {} unusable: {e:#}", path.display()),
            }
        }
    }

    if loaded == 0 {
        anyhow::bail!("no soundfont could be loaded; synthesis would be silent");
    }
    Ok(loaded)
}

fn load_font(synth: &mut Synth, path: &Path) -> Result<oxisynth::SoundFontId> {
    let mut file =
        File::open(path).with_context(|| format!("open sound-font {}", path.display()))?;
    let font = SoundFont::load(&mut file)
        .map_err(|e| anyhow!("load sound-font {}: {e}", path.display()))?;
    Ok(synth.add_font(font, true))
}

// ───────────────────────────── adapter handle ──────────────────────────── //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Configured,
    Ready,
    ShuttingDown,
    Destroyed,
}

/// The runtime-mutable settings last pushed into the engine, kept for the
/// reload diff so unchanged parameters cause no engine calls.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AppliedSettings {
    gain: f32,
    chorus_enabled: bool,
    chorus_level: f32,
    reverb_enabled: bool,
    reverb_level: f32,
}

impl AppliedSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            gain: config.gain,
            chorus_enabled: config.chorus.enabled,
            chorus_level: config.chorus.level,
            reverb_enabled: config.reverb.enabled,
            reverb_level: config.reverb.level,
        }
    }
}

struct EngineCore {
    backend: Box<dyn SynthBackend>,
    state: EngineState,
    applied: AppliedSettings,
    /// Active-note set per channel, one bit per key. The engine itself has
    /// no voice-count query, so the adapter keeps the channel state.
    notes: [u128; MIDI_CHANNELS as usize],
}

impl EngineCore {
    fn note_count(&self) -> u32 {
        self.notes.iter().map(|bits| bits.count_ones()).sum()
    }
}

struct EngineShared {
    core: Mutex<EngineCore>,
    /// Render load as f32 bits, maintained by the audio callback.
    cpu_load: AtomicU32,
    sample_rate: AtomicU32,
    buffer_size: AtomicU32,
    fonts_loaded: usize,
}

/// Read-only snapshot of engine health; no side effects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub active_notes: u32,
    pub polyphony: u32,
    pub cpu_load: f32,
    pub fonts_loaded: usize,
    pub sample_rate: u32,
    pub buffer_size: u32,
}

/// Shareable handle to the synthesis engine adapter. Cloned into the MIDI
/// transports and the audio callback; all of them serialize on the inner
/// lock.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

fn check(param: &'static str, value: i64, max: i64) -> Result<(), EngineError> {
    if value > max {
        Err(EngineError::OutOfRange { param, value, max })
    } else {
        Ok(())
    }
}

impl EngineHandle {
    pub(crate) fn new(backend: Box<dyn SynthBackend>, config: &Config) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                core: Mutex::new(EngineCore {
                    backend,
                    state: EngineState::Configured,
                    applied: AppliedSettings::from_config(config),
                    notes: [0; MIDI_CHANNELS as usize],
                }),
                cpu_load: AtomicU32::new(0.0f32.to_bits()),
                sample_rate: AtomicU32::new(config.sample_rate),
                buffer_size: AtomicU32::new(config.buffer_size),
                fonts_loaded: 0,
            }),
        }
    }

    pub(crate) fn with_fonts(backend: Box<dyn SynthBackend>, config: &Config, fonts: usize) -> Self {
        let mut handle = Self::new(backend, config);
        // Arc is still unique here, so this cannot fail.
        if let Some(shared) = Arc::get_mut(&mut handle.shared) {
            shared.fonts_loaded = fonts;
        }
        handle
    }

    /// Called once the output stream is up, with the format the device
    /// actually granted. Enters `Ready`.
    pub(crate) fn mark_ready(&self, sample_rate: u32, buffer_size: u32) {
        let mut core = self.shared.core.lock();
        if sample_rate != self.shared.sample_rate.load(Ordering::Relaxed) {
            core.backend.set_sample_rate(sample_rate as f32);
            // A rate change rebuilds the engine's effect units; push the
            // current settings back in.
            let applied = core.applied;
            core.backend
                .set_chorus(applied.chorus_enabled, applied.chorus_level);
            core.backend
                .set_reverb(applied.reverb_enabled, applied.reverb_level);
        }
        self.shared.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.shared.buffer_size.store(buffer_size, Ordering::Relaxed);
        core.state = EngineState::Ready;
    }

    pub(crate) fn mark_shutting_down(&self) {
        self.shared.core.lock().state = EngineState::ShuttingDown;
    }

    pub(crate) fn mark_destroyed(&self) {
        self.shared.core.lock().state = EngineState::Destroyed;
    }

    pub fn state(&self) -> EngineState {
        self.shared.core.lock().state
    }

    fn ready(core: &EngineCore) -> Result<(), EngineError> {
        if core.state == EngineState::Ready {
            Ok(())
        } else {
            Err(EngineError::NotReady)
        }
    }

    pub fn note_on(&self, channel: u8, key: u8, vel: u8) -> Result<(), EngineError> {
        check("channel", channel.into(), 15)?;
        check("note", key.into(), 127)?;
        check("velocity", vel.into(), 127)?;
        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        core.backend.note_on(channel, key, vel)?;
        // Velocity 0 is a note-off downstream; mirror that in the set.
        if vel > 0 {
            core.notes[channel as usize] |= 1 << key;
        } else {
            core.notes[channel as usize] &= !(1 << key);
        }
        Ok(())
    }

    /// Release velocity is validated but not forwarded; the engine's
    /// note-off has no use for it.
    pub fn note_off(&self, channel: u8, key: u8, vel: u8) -> Result<(), EngineError> {
        check("channel", channel.into(), 15)?;
        check("note", key.into(), 127)?;
        check("velocity", vel.into(), 127)?;
        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        core.backend.note_off(channel, key)?;
        core.notes[channel as usize] &= !(1 << key);
        Ok(())
    }

    pub fn control_change(&self, channel: u8, ctrl: u8, value: u8) -> Result<(), EngineError> {
        check("channel", channel.into(), 15)?;
        check("controller", ctrl.into(), 127)?;
        check("value", value.into(), 127)?;
        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        core.backend.control_change(channel, ctrl, value)?;
        // CC 120 (all sound off) and CC 123 (all notes off) empty the set.
        if ctrl == 120 || ctrl == 123 {
            core.notes[channel as usize] = 0;
        }
        Ok(())
    }

    pub fn program_change(&self, channel: u8, program: u8) -> Result<(), EngineError> {
        check("channel", channel.into(), 15)?;
        check("program", program.into(), 127)?;
        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        core.backend.program_change(channel, program)
    }

    pub fn pitch_bend(&self, channel: u8, value: u16) -> Result<(), EngineError> {
        check("channel", channel.into(), 15)?;
        check("pitch bend", value.into(), 16_383)?;
        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        core.backend.pitch_bend(channel, value)
    }

    pub fn channel_pressure(&self, channel: u8, value: u8) -> Result<(), EngineError> {
        check("channel", channel.into(), 15)?;
        check("pressure", value.into(), 127)?;
        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        core.backend.channel_pressure(channel, value)
    }

    pub fn key_pressure(&self, channel: u8, key: u8, value: u8) -> Result<(), EngineError> {
        check("channel", channel.into(), 15)?;
        check("note", key.into(), 127)?;
        check("pressure", value.into(), 127)?;
        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        core.backend.key_pressure(channel, key, value)
    }

    /// Best-effort panic: every channel gets its all-notes-off, failures on
    /// individual channels are logged and do not stop the sweep.
    pub fn all_notes_off(&self) -> Result<(), EngineError> {
        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        for channel in 0..MIDI_CHANNELS {
            if let Err(e) = core.backend.all_notes_off(channel) {
                log::debug!("all notes off failed on channel {channel}: {e}");
            }
        }
        core.notes = [0; MIDI_CHANNELS as usize];
        Ok(())
    }

    /// The authoritative "silence and rehome" operation: sounds and notes
    /// off, controllers back to documented defaults, pitch bend centered,
    /// program 0 everywhere except the percussion channel.
    pub fn reset_controllers(&self) -> Result<(), EngineError> {
        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        for channel in 0..MIDI_CHANNELS {
            let backend = &mut core.backend;
            let steps: [Result<(), EngineError>; 8] = [
                backend.all_sound_off(channel),
                backend.all_notes_off(channel),
                backend.control_change(channel, 7, 100),  // volume
                backend.control_change(channel, 10, 64),  // pan
                backend.control_change(channel, 11, 127), // expression
                backend.control_change(channel, 64, 0),   // sustain off
                backend.control_change(channel, 123, 0),  // all notes off
                backend.control_change(channel, 121, 0),  // reset controllers
            ];
            for step in steps {
                if let Err(e) = step {
                    log::debug!("controller reset step failed on channel {channel}: {e}");
                }
            }
            if let Err(e) = core.backend.pitch_bend(channel, 8_192) {
                log::debug!("pitch bend reset failed on channel {channel}: {e}");
            }
            if channel != PERCUSSION_CHANNEL {
                if let Err(e) = core.backend.program_change(channel, 0) {
                    log::debug!("program reset failed on channel {channel}: {e}");
                }
            }
        }
        core.notes = [0; MIDI_CHANNELS as usize];
        log::info!("synthesizer reset completed");
        Ok(())
    }

    /// Out-of-range gain is rejected, never silently clamped.
    pub fn set_gain(&self, gain: f32) -> Result<(), EngineError> {
        if !(0.0..=2.0).contains(&gain) {
            return Err(EngineError::OutOfRange {
                param: "gain",
                value: gain as i64,
                max: 2,
            });
        }
        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        core.backend.set_gain(gain);
        core.applied.gain = gain;
        Ok(())
    }

    pub fn gain(&self) -> f32 {
        self.shared.core.lock().backend.gain()
    }

    /// Pushes the runtime-mutable subset of a new configuration into the
    /// engine. Values are diffed against what was last applied; unchanged
    /// parameters cause no engine calls. Validation happens before any push,
    /// so a rejected update leaves the engine untouched.
    pub fn update_settings(&self, config: &Config) -> Result<(), EngineError> {
        let new = AppliedSettings::from_config(config);
        if !(0.0..=2.0).contains(&new.gain) {
            return Err(EngineError::OutOfRange {
                param: "gain",
                value: new.gain as i64,
                max: 2,
            });
        }

        let mut core = self.shared.core.lock();
        Self::ready(&core)?;
        let old = core.applied;

        if new.gain != old.gain {
            core.backend.set_gain(new.gain);
            log::info!("updated gain to {:.2}", new.gain);
        }
        if new.chorus_enabled != old.chorus_enabled || new.chorus_level != old.chorus_level {
            core.backend.set_chorus(new.chorus_enabled, new.chorus_level);
            log::info!(
                "updated chorus: {} (level {:.2})",
                if new.chorus_enabled { "on" } else { "off" },
                new.chorus_level
            );
        }
        if new.reverb_enabled != old.reverb_enabled || new.reverb_level != old.reverb_level {
            core.backend.set_reverb(new.reverb_enabled, new.reverb_level);
            log::info!(
                "updated reverb: {} (level {:.2})",
                if new.reverb_enabled { "on" } else { "off" },
                new.reverb_level
            );
        }
        core.applied = new;
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        let core = self.shared.core.lock();
        EngineStatus {
            state: core.state,
            active_notes: core.note_count(),
            polyphony: core.backend.polyphony(),
            cpu_load: f32::from_bits(self.shared.cpu_load.load(Ordering::Relaxed)),
            fonts_loaded: self.shared.fonts_loaded,
            sample_rate: self.shared.sample_rate.load(Ordering::Relaxed),
            buffer_size: self.shared.buffer_size.load(Ordering::Relaxed),
        }
    }

    /// Renders `frames` stereo pairs under a single lock acquisition and
    /// maintains the load estimate. Anything but `Ready` renders silence.
    pub(crate) fn render(&self, frames: usize, mut write: impl FnMut((f32, f32))) {
        let start = Instant::now();
        {
            let mut core = self.shared.core.lock();
            if core.state == EngineState::Ready {
                for _ in 0..frames {
                    write(core.backend.read_next());
                }
            } else {
                for _ in 0..frames {
                    write((0.0, 0.0));
                }
            }
        }

        let sample_rate = self.shared.sample_rate.load(Ordering::Relaxed);
        if sample_rate == 0 || frames == 0 {
            return;
        }
        let window = frames as f32 / sample_rate as f32;
        let used = start.elapsed().as_secs_f32() / window * 100.0;
        let old = f32::from_bits(self.shared.cpu_load.load(Ordering::Relaxed));
        let smoothed = old * 0.9 + used * 0.1;
        self.shared
            .cpu_load
            .store(smoothed.to_bits(), Ordering::Relaxed);
    }
}

// ──────────────────────────────── tests ────────────────────────────────── //

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        NoteOn(u8, u8, u8),
        NoteOff(u8, u8),
        ControlChange(u8, u8, u8),
        ProgramChange(u8, u8),
        PitchBend(u8, u16),
        ChannelPressure(u8, u8),
        KeyPressure(u8, u8, u8),
        AllNotesOff(u8),
        AllSoundOff(u8),
        Gain(f32),
        Chorus(bool, f32),
        Reverb(bool, f32),
    }

    pub(crate) type CallLog = Arc<Mutex<Vec<Call>>>;

    /// Records every engine call; optionally fails `all_notes_off` on one
    /// channel to exercise best-effort sweeps.
    pub(crate) struct MockBackend {
        pub calls: CallLog,
        pub fail_all_notes_off_on: Option<u8>,
        gain: f32,
    }

    impl MockBackend {
        pub(crate) fn new() -> (Self, CallLog) {
            let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    calls: Arc::clone(&calls),
                    fail_all_notes_off_on: None,
                    gain: 0.8,
                },
                calls,
            )
        }

        fn record(&self, call: Call) {
            self.calls.lock().push(call);
        }
    }

    impl SynthBackend for MockBackend {
        fn note_on(&mut self, channel: u8, key: u8, vel: u8) -> Result<(), EngineError> {
            self.record(Call::NoteOn(channel, key, vel));
            Ok(())
        }

        fn note_off(&mut self, channel: u8, key: u8) -> Result<(), EngineError> {
            self.record(Call::NoteOff(channel, key));
            Ok(())
        }

        fn control_change(&mut self, channel: u8, ctrl: u8, value: u8) -> Result<(), EngineError> {
            self.record(Call::ControlChange(channel, ctrl, value));
            Ok(())
        }

        fn program_change(&mut self, channel: u8, program: u8) -> Result<(), EngineError> {
            self.record(Call::ProgramChange(channel, program));
            Ok(())
        }

        fn pitch_bend(&mut self, channel: u8, value: u16) -> Result<(), EngineError> {
            self.record(Call::PitchBend(channel, value));
            Ok(())
        }

        fn channel_pressure(&mut self, channel: u8, value: u8) -> Result<(), EngineError> {
            self.record(Call::ChannelPressure(channel, value));
            Ok(())
        }

        fn key_pressure(&mut self, channel: u8, key: u8, value: u8) -> Result<(), EngineError> {
            self.record(Call::KeyPressure(channel, key, value));
            Ok(())
        }

        fn all_notes_off(&mut self, channel: u8) -> Result<(), EngineError> {
            self.record(Call::AllNotesOff(channel));
            if self.fail_all_notes_off_on == Some(channel) {
                Err(EngineError::Backend("injected failure".into()))
            } else {
                Ok(())
            }
        }

        fn all_sound_off(&mut self, channel: u8) -> Result<(), EngineError> {
            self.record(Call::AllSoundOff(channel));
            Ok(())
        }

        fn set_gain(&mut self, gain: f32) {
            self.gain = gain;
            self.record(Call::Gain(gain));
        }

        fn gain(&self) -> f32 {
            self.gain
        }

        fn set_chorus(&mut self, enabled: bool, level: f32) {
            self.record(Call::Chorus(enabled, level));
        }

        fn set_reverb(&mut self, enabled: bool, level: f32) {
            self.record(Call::Reverb(enabled, level));
        }

        fn set_sample_rate(&mut self, _sample_rate: f32) {}

        fn polyphony(&self) -> u32 {
            256
        }

        fn read_next(&mut self) -> (f32, f32) {
            (0.0, 0.0)
        }
    }

    /// A `Ready` handle over a fresh mock, plus the shared call log.
    pub(crate) fn ready_handle() -> (EngineHandle, CallLog) {
        ready_handle_with(Config::default())
    }

    pub(crate) fn ready_handle_with(config: Config) -> (EngineHandle, CallLog) {
        let (mock, calls) = MockBackend::new();
        let handle = EngineHandle::with_fonts(Box::new(mock), &config, 1);
        handle.mark_ready(config.sample_rate, config.buffer_size);
        (handle, calls)
    }
}
