use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use std::path::PathBuf;
use synthd::config::{AudioBackend, Config, ConfigSource, LogLevel, MidiDriver, SoundFontSpec};

#[derive(Parser, Debug)]
#[command(
    name = "synthd",
    version,
    about = "System-level MIDI synthesizer daemon",
    after_help = "Connect MIDI devices with: aconnect <source> 'synthd'\n\
                  Signals: SIGHUP reload, SIGUSR1 status, SIGUSR2 MIDI panic"
)]
struct Cli {
    /// Use this configuration file instead of the standard search paths
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Detach and run in the background (default: foreground for systemd)
    #[arg(short, long)]
    daemonize: bool,

    /// Enable debug logging
    #[arg(long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Load, validate and print the configuration, then exit
    #[arg(long)]
    test_config: bool,

    /// Override the configured soundfont list with a single file
    #[arg(short, long, value_name = "SF2")]
    soundfont: Option<PathBuf>,

    /// Disable realtime scheduling for the audio thread
    #[arg(long)]
    no_realtime: bool,

    /// Run as this user when started as root
    #[arg(short, long)]
    user: Option<String>,

    /// Run as this group when started as root
    #[arg(short, long)]
    group: Option<String>,

    /// Audio backend to target
    #[arg(short, long, value_enum)]
    backend: Option<AudioBackend>,

    /// MIDI input transport
    #[arg(short, long, value_enum)]
    midi_driver: Option<MidiDriver>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The builder filter is left wide open; the effective level is driven
    // through log::set_max_level so a SIGHUP reload can change it later.
    env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();
    let cli_level = if cli.verbose {
        Some(LogLevel::Debug)
    } else if cli.quiet {
        Some(LogLevel::Warn)
    } else {
        None
    };
    log::set_max_level(cli_level.unwrap_or(LogLevel::Info).to_filter());

    let source = match &cli.config {
        Some(path) => ConfigSource::Explicit(path.clone()),
        None => ConfigSource::Standard,
    };
    let mut config = Config::load(&source)?;
    apply_overrides(&mut config, &cli);

    let repairs = config.validate();
    if repairs > 0 {
        log::warn!("configuration had {repairs} invalid value(s), repaired");
    }
    log::set_max_level(config.log_level.to_filter());

    if cli.test_config {
        println!("Configuration test successful\n");
        config.print();
        return Ok(());
    }

    // Detach before any threads or audio resources exist.
    if cli.daemonize {
        synthd::privs::daemonize()?;
    }

    synthd::daemon::run(config, source)
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if cli.verbose {
        config.log_level = LogLevel::Debug;
    } else if cli.quiet {
        config.log_level = LogLevel::Warn;
    }
    if let Some(soundfont) = &cli.soundfont {
        config.soundfonts = vec![SoundFontSpec::new(soundfont.clone())];
    }
    if cli.no_realtime {
        config.realtime_priority = false;
    }
    if let Some(user) = &cli.user {
        config.user = Some(user.clone());
    }
    if let Some(group) = &cli.group {
        config.group = Some(group.clone());
    }
    if let Some(backend) = cli.backend {
        config.audio_backend = backend;
    }
    if let Some(midi_driver) = cli.midi_driver {
        config.midi_driver = midi_driver;
    }
}
