//! Command-line interface for voicepipe
//!
//! Provides argument parsing using clap derive macros.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Real-time voice capture and transmission pipeline
#[derive(Parser, Debug)]
#[command(name = "voicepipe", version, about = "Real-time voice capture and transmission pipeline")]
pub struct Cli {
    /// Subcommand to execute (default: run)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress the run summary
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture from a device or WAV file through the full pipeline
    Run(RunArgs),

    /// List available audio input devices
    #[cfg(feature = "cpal-audio")]
    Devices,

    /// View configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Play this WAV file instead of capturing a device
    #[arg(long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Audio input device (default: from config, else system default)
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// How long to run. Examples: 10s, 1m30s, 2h
    #[arg(long, short = 'd', value_name = "DURATION", default_value = "10s", value_parser = parse_duration)]
    pub duration: Duration,

    /// Loop the WAV file until the duration elapses
    #[arg(long = "loop")]
    pub looping: bool,

    /// Start with transmission muted
    #[arg(long)]
    pub muted: bool,

    /// Record processed audio as WAV files into this directory
    #[arg(long, value_name = "DIR")]
    pub record: Option<PathBuf>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            file: None,
            device: None,
            duration: Duration::from_secs(10),
            looping: false,
            muted: false,
            record: None,
        }
    }
}

/// Configuration actions
#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default configuration file path
    Path,
}

/// Parse a run duration.
///
/// Supports any duration format accepted by `humantime`; a bare number is
/// taken as seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_command() {
        let cli = Cli::try_parse_from(["voicepipe"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_verbose_double() {
        let cli = Cli::try_parse_from(["voicepipe", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_parse_run_defaults() {
        let cli = Cli::try_parse_from(["voicepipe", "run"]).unwrap();
        match cli.command {
            Some(Commands::Run(args)) => assert_eq!(args, RunArgs::default()),
            other => panic!("Expected Run command, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_run_with_options() {
        let cli = Cli::try_parse_from([
            "voicepipe",
            "run",
            "--file",
            "speech.wav",
            "--duration",
            "1m30s",
            "--loop",
            "--record",
            "/tmp/diag",
        ])
        .unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("Expected Run command");
        };
        assert_eq!(args.file, Some(PathBuf::from("speech.wav")));
        assert_eq!(args.duration, Duration::from_secs(90));
        assert!(args.looping);
        assert!(!args.muted);
        assert_eq!(args.record, Some(PathBuf::from("/tmp/diag")));
    }

    #[test]
    fn test_parse_bare_seconds() {
        let cli = Cli::try_parse_from(["voicepipe", "run", "-d", "3"]).unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("Expected Run command");
        };
        assert_eq!(args.duration, Duration::from_secs(3));
    }

    #[test]
    fn test_parse_invalid_duration() {
        assert!(Cli::try_parse_from(["voicepipe", "run", "-d", "soon"]).is_err());
    }

    #[test]
    fn test_parse_config_show() {
        let cli = Cli::try_parse_from(["voicepipe", "config", "show"]).unwrap();
        match cli.command {
            Some(Commands::Config { action }) => assert_eq!(action, ConfigAction::Show),
            other => panic!("Expected Config command, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_global_config_after_subcommand() {
        let cli =
            Cli::try_parse_from(["voicepipe", "run", "--config", "/etc/voicepipe.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/voicepipe.toml")));
    }
}
