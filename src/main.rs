use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use noisetimer::capture::{Capture, Threshold};
use noisetimer::config::{self, Settings};
use noisetimer::meter::{HidMeter, LevelSampler, LevelSummary};
use noisetimer::{CaptureSession, CpalSource, Direction, TrialLog, TrialRecord, WavFileSource};
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "noisetimer")]
#[command(about = "Acoustic timing harness for actuator calibration on Linux")]
#[command(version = "0.1.0")]
struct Cli {
    /// Config file (defaults to ~/.config/noisetimer/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List audio input devices and whether they can run at the configured rate
    Devices {
        /// Sample rate to check instead of the configured one
        #[arg(long)]
        sample_rate: Option<u32>,
    },

    /// Capture one actuator move and measure how long it was audible
    Trial {
        /// Seconds to record before stopping
        #[arg(long, default_value = "2", value_parser = parse_duration_secs)]
        duration: Duration,

        /// Normalized noise threshold (0-1)
        #[arg(long)]
        threshold: Option<f32>,

        /// Audio input device name
        #[arg(long)]
        device: Option<String>,

        /// Audio sample rate in Hz
        #[arg(long)]
        sample_rate: Option<u32>,

        /// Don't save the raw recording
        #[arg(long)]
        no_save: bool,

        /// Don't sample the sound level meter
        #[arg(long)]
        no_meter: bool,

        /// Move direction; with the fields below, appends the trial to the log
        #[arg(long, value_parser = parse_direction)]
        direction: Option<Direction>,

        /// Actuator speed
        #[arg(long)]
        speed: Option<u32>,

        /// Actuator travel range
        #[arg(long)]
        range: Option<u32>,

        /// Position before the move
        #[arg(long = "from")]
        start_position: Option<u32>,

        /// Position after the move
        #[arg(long = "to")]
        end_position: Option<u32>,

        /// Print the envelope report
        #[arg(long)]
        report: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Measure the noise period of a saved recording
    Analyze {
        /// WAV file to replay
        recording: PathBuf,

        /// Normalized noise threshold (0-1)
        #[arg(long)]
        threshold: Option<f32>,

        /// Print the envelope report
        #[arg(long)]
        report: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Sample the sound level meter until Enter is pressed
    Meter {
        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_direction(s: &str) -> Result<Direction, String> {
    s.parse()
}

fn parse_duration_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("`{}` is not a number of seconds", s))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration `{}`: {}", s, e))
}

struct TrialOptions {
    duration: Duration,
    save: bool,
    meter: bool,
    report: bool,
    format: OutputFormat,
    record: Option<TrialMove>,
}

/// Actuator move the trial is logged against
struct TrialMove {
    direction: Direction,
    speed: u32,
    range: u32,
    start_position: u32,
    end_position: u32,
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
}

fn list_devices(sample_rate: u32) -> Result<()> {
    let devices = CpalSource::list_devices().context("Failed to list audio devices")?;

    println!("Audio input devices (f32 capture):");
    println!(
        "{:<30} {:<8} {:<9} {:<24} At {} Hz",
        "Name", "Default", "Channels", "Rates", sample_rate
    );
    println!("{}", "-".repeat(84));

    for device in devices {
        let rates = device
            .rate_ranges
            .iter()
            .map(|&(min, max)| {
                if min == max {
                    min.to_string()
                } else {
                    format!("{}-{}", min, max)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let fit = match device.effective_rate(sample_rate) {
            Some(rate) if rate == sample_rate => "ok".to_string(),
            Some(rate) => format!("falls back to {} Hz", rate),
            None => "unusable".to_string(),
        };

        println!(
            "{:<30} {:<8} {:<9} {:<24} {}",
            device.name.chars().take(30).collect::<String>(),
            if device.is_default { "*" } else { "" },
            device.max_channels,
            if rates.is_empty() { "-" } else { rates.as_str() },
            fit
        );
    }

    Ok(())
}

fn run_trial(settings: &Settings, options: TrialOptions) -> Result<()> {
    let source = CpalSource::new(settings.audio_device.as_deref(), settings.sample_rate)
        .context("Failed to open audio input")?;
    let mut capture = Capture::with_frame_duration(source, settings.frame_duration())?;

    let mut sampler = if options.meter {
        let meter = HidMeter::open_or_disconnected(settings.meter_vendor_id, settings.meter_product_id);
        Some(LevelSampler::with_interval(meter, settings.poll_interval())?)
    } else {
        None
    };

    let recording = if options.save {
        Some(settings.recordings_dir()?.join(config::recording_name()))
    } else {
        None
    };

    capture.start(recording.as_deref())?;
    if let Some(sampler) = sampler.as_mut() {
        sampler.start_monitor()?;
    }

    thread::sleep(options.duration);

    let session = capture.stop()?;
    let levels = sampler.as_mut().and_then(|sampler| sampler.end_monitor());
    let noise = session.noise_period(Threshold::new(settings.threshold)?);

    if let Some(details) = options.record {
        let record = TrialRecord {
            direction: details.direction,
            speed: details.speed,
            range: details.range,
            noise,
            start_position: details.start_position,
            end_position: details.end_position,
            recording: session.recording().map(|path| path.to_path_buf()),
            peak_level: levels.map(|summary| summary.max).unwrap_or(0.0),
        };
        let log = TrialLog::new(&settings.trial_log);
        log.append(&record)?;
        info!(log = %log.path().display(), "trial recorded");
    }

    print_result(
        session,
        settings.threshold,
        noise,
        levels,
        options.report,
        options.format,
    )
}

fn analyze(
    settings: &Settings,
    recording: PathBuf,
    threshold: f32,
    report: bool,
    format: OutputFormat,
) -> Result<()> {
    let threshold = Threshold::new(threshold)?;
    let source = WavFileSource::open(&recording)?;
    let mut capture = Capture::with_frame_duration(source, settings.frame_duration())?;

    capture.start(None)?;
    capture.source().wait_finished();
    let session = capture.stop()?;
    let noise = session.noise_period(threshold);

    print_result(session, threshold.value(), noise, None, report, format)
}

fn print_result(
    session: &CaptureSession,
    threshold: f32,
    noise: Duration,
    levels: Option<LevelSummary>,
    report: bool,
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if report {
                print!("{}", session.report());
            }
            println!("Found {}ms of noise", noise.as_millis());
            if let Some(path) = session.recording() {
                println!("Recording: {}", path.display());
            }
            match levels {
                Some(summary) => println!("Sound level: {}", summary),
                None => println!("Sound level: no data"),
            }
        }
        OutputFormat::Json => {
            let envelope = session.envelope();
            let json = serde_json::json!({
                "noise_ms": noise.as_millis() as u64,
                "threshold": threshold,
                "frames": envelope.len(),
                "captured_ms": envelope.captured_duration().as_millis() as u64,
                "elapsed_ms": session.elapsed().as_millis() as u64,
                "range": envelope.min().zip(envelope.max()).map(|(min, max)| [min, max]),
                "recording": session.recording().map(|p| p.display().to_string()),
                "levels": levels.map(level_json),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    Ok(())
}

fn level_json(summary: LevelSummary) -> serde_json::Value {
    serde_json::json!({
        "max": summary.max,
        "average": summary.average,
        "min": summary.min,
        "samples": summary.samples,
    })
}

fn run_meter(settings: &Settings, format: OutputFormat) -> Result<()> {
    let meter = HidMeter::open(settings.meter_vendor_id, settings.meter_product_id)?;
    let mut sampler = LevelSampler::with_interval(meter, settings.poll_interval())?;

    sampler.start_monitor()?;
    eprintln!("Sampling sound level, press Enter to stop");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let summary = sampler.end_monitor();

    match format {
        OutputFormat::Text => match summary {
            Some(summary) => println!("{}", summary),
            None => println!("No data recorded!"),
        },
        OutputFormat::Json => {
            let json = serde_json::json!({ "levels": summary.map(level_json) });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Devices { sample_rate } => {
            let settings = load_settings(cli.config.as_ref())?;
            list_devices(sample_rate.unwrap_or(settings.sample_rate))
        }

        Commands::Trial {
            duration,
            threshold,
            device,
            sample_rate,
            no_save,
            no_meter,
            direction,
            speed,
            range,
            start_position,
            end_position,
            report,
            format,
        } => {
            let mut settings = load_settings(cli.config.as_ref())?;
            if let Some(threshold) = threshold {
                settings.threshold = threshold;
            }
            if device.is_some() {
                settings.audio_device = device;
            }
            if let Some(sample_rate) = sample_rate {
                settings.sample_rate = sample_rate;
            }
            settings.validate()?;

            let record = match (direction, speed, range, start_position, end_position) {
                (Some(direction), Some(speed), Some(range), Some(start_position), Some(end_position)) => {
                    Some(TrialMove {
                        direction,
                        speed,
                        range,
                        start_position,
                        end_position,
                    })
                }
                (None, None, None, None, None) => None,
                _ => anyhow::bail!(
                    "--direction, --speed, --range, --from and --to must be given together"
                ),
            };

            run_trial(
                &settings,
                TrialOptions {
                    duration,
                    save: !no_save,
                    meter: !no_meter,
                    report,
                    format,
                    record,
                },
            )
        }

        Commands::Analyze {
            recording,
            threshold,
            report,
            format,
        } => {
            let settings = load_settings(cli.config.as_ref())?;
            let threshold = threshold.unwrap_or(settings.threshold);
            analyze(&settings, recording, threshold, report, format)
        }

        Commands::Meter { format } => {
            let settings = load_settings(cli.config.as_ref())?;
            run_meter(&settings, format)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
