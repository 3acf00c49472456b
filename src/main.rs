//! CLI entry point for lightsheet-daq
//!
//! Runs the acquisition pipeline on the built-in mock hardware:
//! - `run`: volumetric experiment saved to disk, or a planar/volume preview
//! - `check-config`: load and validate a settings file
//!
//! # Usage
//!
//! Save ten seconds of volumes:
//! ```bash
//! lightsheet-daq run --mode volume --duration-s 10 --output data/run1
//! ```
//!
//! Watch a volume preview until Ctrl-C:
//! ```bash
//! lightsheet-daq run --mode preview
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lightsheet_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use lightsheet_daq::scanning::{GalvoSweep, ScanParameters, TriggerWindow, XYScan, ZScan};
use lightsheet_daq::state::TriggerSettings;
use lightsheet_daq::storage::{default_writer, SavingParameters};
use lightsheet_daq::waveforms::SyncCoefficients;
use lightsheet_daq::{logging, GlobalPhase, GlobalState, Hardware, SignalFlag};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "lightsheet-daq")]
#[command(about = "Light-sheet scan synchronization and volume streaming", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline on mock hardware
    Run {
        /// Settings file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// What to acquire
        #[arg(long, value_enum, default_value_t = Mode::Volume)]
        mode: Mode,

        /// Experiment length in seconds; runs until Ctrl-C if omitted
        #[arg(long)]
        duration_s: Option<f64>,

        /// Dataset directory, overrides `saving.output_dir`
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Load and validate a settings file
    CheckConfig {
        /// Settings file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Volumetric experiment saved to disk
    Volume,
    /// Single plane, galvos following the piezo
    Planar,
    /// Volumetric scanning without saving
    Preview,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            mode,
            duration_s,
            output,
        } => {
            let settings = load_settings(&config)?;
            logging::init_from_settings(&settings).context("Failed to initialize logging")?;
            run(settings, mode, duration_s, output).await
        }
        Commands::CheckConfig { config } => {
            let settings = load_settings(&config)?;
            println!("{} is valid", config.display());
            println!(
                "  board: {} at {} Hz, {} samples per chunk",
                settings.scanning.board,
                settings.scanning.sample_rate,
                settings.scanning.n_samples_waveform
            );
            let [width, height] = settings.camera.sensor_resolution;
            println!(
                "  camera: {} {}x{}, binning {}",
                settings.camera.name, width, height, settings.camera.default_binning
            );
            println!("  output: {}", settings.saving.output_dir.display());
            Ok(())
        }
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let settings = Settings::load_from(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

/// Volumetric scan at 1 volume per second with 20 planes.
fn default_scan() -> ScanParameters {
    let galvo = GalvoSweep {
        frequency: 800.0,
        v_min: -0.5,
        v_max: 0.5,
    };
    ScanParameters {
        triggering: TriggerWindow {
            frequency: None,
            n_planes: 20,
            n_skip_start: 1,
            n_skip_end: 1,
        },
        xy: XYScan {
            lateral: galvo,
            frontal: galvo,
        },
        z: ZScan::Scanning {
            frequency: 1.0,
            piezo_min: 0.0,
            piezo_max: 200.0,
            lateral_sync: SyncCoefficients::new(0.0, 0.005),
            frontal_sync: SyncCoefficients::new(0.0, 0.005),
        },
        ..Default::default()
    }
}

async fn run(
    settings: Settings,
    mode: Mode,
    duration_s: Option<f64>,
    output: Option<PathBuf>,
) -> Result<()> {
    let hardware = Hardware::mock(&settings)?;
    let state = GlobalState::launch(&settings, hardware, default_writer());
    state.set_scan_settings(default_scan())?;

    match mode {
        Mode::Volume => {
            let mut saving = SavingParameters::from_config(&settings.saving, &settings.voxel_size);
            if let Some(output) = output {
                saving.output_dir = output;
            }
            state.set_save_settings(saving)?;
            state.set_trigger_settings(TriggerSettings {
                is_triggered: true,
                manual_duration_s: duration_s,
            })?;
            state.start_experiment()?;
            state.trigger_experiment()?;
            wait(&state, None).await;
            state.end_experiment().await?;
        }
        Mode::Planar => {
            state.change_global_state(GlobalPhase::PlanarPreview)?;
            wait(&state, duration_s).await;
        }
        Mode::Preview => {
            state.change_global_state(GlobalPhase::VolumePreview)?;
            wait(&state, duration_s).await;
        }
    }

    let saved = state.get_save_status();
    info!(
        volumes = saved.i_volume,
        chunks = saved.i_chunk,
        dispatcher = ?state.get_dispatcher_status(),
        "acquisition finished"
    );
    state.wrap_up().await?;
    if let Some(error) = saved.error {
        anyhow::bail!("Saving failed: {}", error);
    }
    Ok(())
}

/// Log progress until the dataset is complete, `limit` elapses, the run
/// aborts or Ctrl-C.
async fn wait(state: &Arc<GlobalState>, limit: Option<f64>) {
    let deadline = limit.map(|s| tokio::time::Instant::now() + Duration::from_secs_f64(s));
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        let sleep_until_deadline = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return;
            }
            _ = state.bus().wait_for(SignalFlag::SavingStopped, true) => return,
            _ = sleep_until_deadline => return,
            _ = ticker.tick() => {
                if state.phase() == GlobalPhase::Abort {
                    return;
                }
                let camera = state.get_camera_status();
                let saving = state.get_save_status();
                info!(
                    phase = %state.phase(),
                    framerate = ?camera.framerate,
                    frames = camera.frames_acquired,
                    saved = saving.i_volume,
                    target = ?saving.n_volumes,
                    "status"
                );
            }
        }
    }
}
