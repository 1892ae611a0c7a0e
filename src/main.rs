use anyhow::Result;
use clap::Parser;
use voicepipe::app::{RunSummary, run_capture};
use voicepipe::cli::{Cli, Commands, ConfigAction, RunArgs};
use voicepipe::config::Config;
use voicepipe::telemetry::init_tracing;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        None => {
            let config = load_config(cli.config.as_deref())?;
            run(config, &RunArgs::default(), cli.quiet)?;
        }
        Some(Commands::Run(args)) => {
            let config = load_config(cli.config.as_deref())?;
            run(config, &args, cli.quiet)?;
        }
        #[cfg(feature = "cpal-audio")]
        Some(Commands::Devices) => {
            list_audio_devices()?;
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, cli.config.as_deref())?;
        }
    }

    Ok(())
}

/// Load configuration from a custom path or the default location.
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)?,
        None => match Config::default_path() {
            Some(path) => Config::load_or_default(&path)?,
            None => Config::default(),
        },
    };

    let config = config.with_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn run(config: Config, args: &RunArgs, quiet: bool) -> Result<()> {
    let summary = run_capture(config, args)?;
    if !quiet {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Ran for {:.1}s", summary.elapsed.as_secs_f32());
    println!(
        "  packets: {} sent ({} bytes), {} dropped",
        summary.packets, summary.bytes, summary.packets_dropped
    );
    println!("  speech segments: {}", summary.speech_segments);
    println!("  peak amplitude: {:.3}", summary.peak_amplitude);
    println!("  pipeline rebuilds: {}", summary.rebuilds);
    if let Some(stats) = &summary.pipeline {
        println!(
            "  frames: {} processed, {} silent injected, {} samples overflowed",
            stats.frames_processed, stats.silent_frames_injected, stats.samples_dropped
        );
    }
}

/// List available audio input devices.
#[cfg(feature = "cpal-audio")]
fn list_audio_devices() -> Result<()> {
    let devices = voicepipe::audio::list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

fn handle_config_command(action: ConfigAction, custom_path: Option<&std::path::Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => {
            let path = custom_path
                .map(std::path::PathBuf::from)
                .or_else(Config::default_path);
            match path {
                Some(path) => println!("{}", path.display()),
                None => {
                    eprintln!("No configuration directory available");
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}
