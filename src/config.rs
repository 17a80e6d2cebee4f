//! Daemon configuration: defaults, YAML file loading with user-over-system
//! precedence, validation with repair counting, and the runtime-mutable
//! subset applied on reload.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const SYSTEM_CONFIG_PATH: &str = "/etc/synthd.yaml";
pub const USER_CONFIG_FILE: &str = "synthd.yaml";

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_BUFFER_SIZE: u32 = 256;
pub const DEFAULT_GAIN: f32 = 0.8;
pub const DEFAULT_POLYPHONY: u16 = 256;
pub const DEFAULT_CLIENT_NAME: &str = "synthd";
pub const DEFAULT_CHORUS_LEVEL: f32 = 2.0;
pub const DEFAULT_REVERB_LEVEL: f32 = 0.9;

/// Fallback soundfont locations probed when the configured list yields
/// nothing loadable.
pub const SOUNDFONT_SEARCH_PATHS: &[&str] = &[
    "/usr/share/soundfonts/FluidR3_GM.sf2",
    "/usr/share/sounds/sf2/FluidR3_GM.sf2",
    "/usr/share/soundfonts/default.sf2",
    "/usr/share/sounds/sf2/default.sf2",
];

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Audio backend selection. `Auto` is resolved to a concrete backend once at
/// startup by the driver prober; the concrete choice then holds for the life
/// of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioBackend {
    Auto,
    Jack,
    #[value(name = "pipewire")]
    PipeWire,
    #[value(name = "pulseaudio")]
    PulseAudio,
    Alsa,
}

impl fmt::Display for AudioBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioBackend::Auto => "auto",
            AudioBackend::Jack => "jack",
            AudioBackend::PipeWire => "pipewire",
            AudioBackend::PulseAudio => "pulseaudio",
            AudioBackend::Alsa => "alsa",
        };
        f.write_str(name)
    }
}

/// MIDI input transport selection. Immutable for the life of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MidiDriver {
    /// ALSA sequencer via midir: named connectable port, client enumeration.
    Seq,
    /// Raw JACK MIDI port: timestamped byte buffers.
    Jack,
}

impl fmt::Display for MidiDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MidiDriver::Seq => "seq",
            MidiDriver::Jack => "jack",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
        }
    }
}

/// One instrument bank entry. Disabled entries stay in the file but are
/// skipped at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundFontSpec {
    pub path: PathBuf,
    pub enabled: bool,
    pub bank_offset: u32,
}

impl Default for SoundFontSpec {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            enabled: true,
            bank_offset: 0,
        }
    }
}

impl SoundFontSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectConfig {
    pub enabled: bool,
    pub level: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio_backend: AudioBackend,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub gain: f32,

    pub midi_driver: MidiDriver,
    pub client_name: String,
    pub midi_autoconnect: bool,

    pub polyphony: u16,
    pub soundfonts: Vec<SoundFontSpec>,
    pub chorus: EffectConfig,
    pub reverb: EffectConfig,

    pub log_level: LogLevel,
    pub realtime_priority: bool,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio_backend: AudioBackend::Auto,
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            gain: DEFAULT_GAIN,
            midi_driver: MidiDriver::Seq,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            midi_autoconnect: true,
            polyphony: DEFAULT_POLYPHONY,
            soundfonts: Vec::new(),
            chorus: EffectConfig {
                enabled: true,
                level: DEFAULT_CHORUS_LEVEL,
            },
            reverb: EffectConfig {
                enabled: true,
                level: DEFAULT_REVERB_LEVEL,
            },
            log_level: LogLevel::Info,
            realtime_priority: true,
            user: None,
            group: None,
        }
    }
}

/// Where the active configuration came from, so a reload re-reads the same
/// source.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// `--config FILE`: always that file.
    Explicit(PathBuf),
    /// Standard precedence: user file, then system file, then defaults.
    Standard,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Standard precedence: the first existing file wins. Every field has a
    /// default, so partial files are fine.
    pub fn load_standard() -> Result<Self, ConfigError> {
        if let Some(dir) = dirs::config_dir() {
            let user_path = dir.join(USER_CONFIG_FILE);
            if user_path.exists() {
                return Self::from_file(&user_path);
            }
        }
        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            return Self::from_file(system_path);
        }
        log::info!("no configuration file found, using built-in defaults");
        Ok(Self::default())
    }

    pub fn load(source: &ConfigSource) -> Result<Self, ConfigError> {
        match source {
            ConfigSource::Explicit(path) => Self::from_file(path),
            ConfigSource::Standard => Self::load_standard(),
        }
    }

    /// Repairs out-of-range values back to their defaults and returns how
    /// many repairs were made. Never fails: a repaired configuration is
    /// always usable.
    pub fn validate(&mut self) -> u32 {
        let mut fixes = 0;
        if !(8_000..=192_000).contains(&self.sample_rate) {
            log::warn!(
                "invalid sample rate {}, using default {}",
                self.sample_rate,
                DEFAULT_SAMPLE_RATE
            );
            self.sample_rate = DEFAULT_SAMPLE_RATE;
            fixes += 1;
        }
        if !(64..=8_192).contains(&self.buffer_size) {
            log::warn!(
                "invalid buffer size {}, using default {}",
                self.buffer_size,
                DEFAULT_BUFFER_SIZE
            );
            self.buffer_size = DEFAULT_BUFFER_SIZE;
            fixes += 1;
        }
        if !(0.0..=2.0).contains(&self.gain) {
            log::warn!("invalid gain {:.2}, using default {:.2}", self.gain, DEFAULT_GAIN);
            self.gain = DEFAULT_GAIN;
            fixes += 1;
        }
        if !(16..=4_096).contains(&self.polyphony) {
            log::warn!(
                "invalid polyphony {}, using default {}",
                self.polyphony,
                DEFAULT_POLYPHONY
            );
            self.polyphony = DEFAULT_POLYPHONY;
            fixes += 1;
        }
        if !(0.0..=10.0).contains(&self.chorus.level) {
            log::warn!(
                "invalid chorus level {:.2}, using default {:.2}",
                self.chorus.level,
                DEFAULT_CHORUS_LEVEL
            );
            self.chorus.level = DEFAULT_CHORUS_LEVEL;
            fixes += 1;
        }
        if !(0.0..=10.0).contains(&self.reverb.level) {
            log::warn!(
                "invalid reverb level {:.2}, using default {:.2}",
                self.reverb.level,
                DEFAULT_REVERB_LEVEL
            );
            self.reverb.level = DEFAULT_REVERB_LEVEL;
            fixes += 1;
        }
        if self.client_name.is_empty() {
            log::warn!("empty client name, using default '{DEFAULT_CLIENT_NAME}'");
            self.client_name = DEFAULT_CLIENT_NAME.to_string();
            fixes += 1;
        }
        fixes
    }

    /// Adopts the runtime-mutable subset from a freshly loaded configuration.
    /// Everything else (backend, transport, sample rate, fonts, ...) needs a
    /// restart and is deliberately left alone.
    pub fn apply_runtime(&mut self, new: &Config) {
        self.gain = new.gain;
        self.chorus = new.chorus;
        self.reverb = new.reverb;
        self.log_level = new.log_level;
    }

    pub fn print(&self) {
        println!("Audio:");
        println!("  Backend:       {}", self.audio_backend);
        println!("  Sample rate:   {} Hz", self.sample_rate);
        println!("  Buffer size:   {} frames", self.buffer_size);
        println!("  Gain:          {:.2}", self.gain);
        println!("MIDI:");
        println!("  Driver:        {}", self.midi_driver);
        println!("  Client name:   {}", self.client_name);
        println!("  Autoconnect:   {}", self.midi_autoconnect);
        println!("Synthesis:");
        println!("  Polyphony:     {} voices", self.polyphony);
        println!(
            "  Chorus:        {} (level {:.2})",
            if self.chorus.enabled { "on" } else { "off" },
            self.chorus.level
        );
        println!(
            "  Reverb:        {} (level {:.2})",
            if self.reverb.enabled { "on" } else { "off" },
            self.reverb.level
        );
        if self.soundfonts.is_empty() {
            println!("  Soundfonts:    (default search paths)");
        } else {
            println!("  Soundfonts:");
            for sf in &self.soundfonts {
                println!(
                    "    {} [{}{}]",
                    sf.path.display(),
                    if sf.enabled { "enabled" } else { "disabled" },
                    if sf.bank_offset != 0 {
                        format!(", bank offset {}", sf.bank_offset)
                    } else {
                        String::new()
                    }
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let mut config = Config::default();
        assert_eq!(config.validate(), 0);
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.audio_backend, AudioBackend::Auto);
        assert_eq!(config.midi_driver, MidiDriver::Seq);
        assert!(config.midi_autoconnect);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let file = write_config("sample_rate: 44100\ngain: 1.5\n");
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.gain, 1.5);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.client_name, DEFAULT_CLIENT_NAME);
    }

    #[test]
    fn enums_parse_lowercase() {
        let file = write_config(
            "audio_backend: pulseaudio\nmidi_driver: jack\nlog_level: debug\n",
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.audio_backend, AudioBackend::PulseAudio);
        assert_eq!(config.midi_driver, MidiDriver::Jack);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn soundfont_entries_parse() {
        let file = write_config(
            "soundfonts:\n  - path: /tmp/a.sf2\n  - path: /tmp/b.sf2\n    enabled: false\n    bank_offset: 128\n",
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.soundfonts.len(), 2);
        assert!(config.soundfonts[0].enabled);
        assert_eq!(config.soundfonts[0].bank_offset, 0);
        assert!(!config.soundfonts[1].enabled);
        assert_eq!(config.soundfonts[1].bank_offset, 128);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let file = write_config("sample_rate: [not a number\n");
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::from_file(Path::new("/nonexistent/synthd.yaml"));
        assert!(matches!(err, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn validate_repairs_out_of_range_values() {
        let mut config = Config {
            sample_rate: 1,
            buffer_size: 1_000_000,
            gain: 9.0,
            polyphony: 2,
            ..Config::default()
        };
        config.chorus.level = -3.0;
        assert_eq!(config.validate(), 5);
        assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.gain, DEFAULT_GAIN);
        assert_eq!(config.polyphony, DEFAULT_POLYPHONY);
        assert_eq!(config.chorus.level, DEFAULT_CHORUS_LEVEL);
    }

    #[test]
    fn apply_runtime_touches_only_the_mutable_subset() {
        let mut active = Config::default();
        let mut incoming = Config::default();
        incoming.gain = 1.2;
        incoming.chorus.enabled = false;
        incoming.reverb.level = 0.1;
        incoming.log_level = LogLevel::Debug;
        incoming.sample_rate = 96_000;
        incoming.midi_driver = MidiDriver::Jack;

        active.apply_runtime(&incoming);
        assert_eq!(active.gain, 1.2);
        assert!(!active.chorus.enabled);
        assert_eq!(active.reverb.level, 0.1);
        assert_eq!(active.log_level, LogLevel::Debug);
        // Restart-only settings stay put.
        assert_eq!(active.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(active.midi_driver, MidiDriver::Seq);
    }
}
