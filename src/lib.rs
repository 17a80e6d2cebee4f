//! synthd: a system-level MIDI synthesizer daemon.
//!
//! Bridges incoming MIDI to a SoundFont synthesizer and routes the audio to
//! whichever sound server is active on the host. The pipeline is built in a
//! fixed order at startup: the driver prober picks a concrete audio backend,
//! the engine comes up against it (fonts loaded, output stream running),
//! and one MIDI input transport is bound to the engine handle. After that a
//! small supervision loop handles signals, reloads, and transport failures
//! until shutdown, which tears the pieces down in reverse.

pub mod audio;
pub mod config;
pub mod daemon;
pub mod driver;
pub mod engine;
pub mod midi;
pub mod midi_jack;
pub mod privs;

pub use config::{AudioBackend, Config, ConfigSource, LogLevel, MidiDriver};
pub use daemon::run;
