use facegate::{
    audit::FileAuditLog,
    camera::{self, FrameSource, V4l2Camera},
    cli::{annotate_detections, run_interactive},
    common::{Config, DevMode},
    core::{AuthState, EnrollState, FaceDetector, HaarCascadeDetector},
    service::FaceGate,
    storage::IdentityId,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Grabs allowed before a one-shot camera command gives up.
const SNAPSHOT_TRIES: u32 = 30;

#[derive(Parser)]
#[command(name = "facegate")]
#[command(about = "Face-based authentication gate")]
struct Cli {
    /// Enable development mode (saves data locally for testing)
    #[arg(long, global = true)]
    dev: bool,

    /// Configuration file (defaults to configs/facegate.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from the camera
    Enroll {
        #[arg(short, long)]
        name: String,
    },
    /// Run one authentication session
    Auth,
    /// List enrolled identities
    List,
    /// Change an identity's display name
    Rename {
        #[arg(short, long)]
        id: IdentityId,
        #[arg(short, long)]
        name: String,
    },
    /// Delete an identity and its samples
    Delete {
        #[arg(short, long)]
        id: IdentityId,
    },
    /// Rebuild the model from every stored sample
    Retrain,
    /// Show the security log
    Logs {
        /// Truncate the log instead of printing it
        #[arg(long)]
        clear: bool,
    },
    /// List video devices and the IR auto-detect choice
    ListCameras,
    /// Capture one frame and save it
    TestCamera,
    /// Capture one frame and save it with detected faces outlined
    TestDetection,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    setup_logging(cli.dev);

    let dev_mode = DevMode::new(cli.dev)?;
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Enroll { name } => {
            let gate = FaceGate::open(config, &dev_mode)?;
            let camera_config = gate.config().camera.clone();
            println!("Enrolling: {}", name);

            let report = run_interactive(move |notifier, cancel| {
                let mut camera = V4l2Camera::open(&camera_config)?;
                gate.enroll(&name, &mut camera, &notifier, &cancel)
            })?;

            match report.state {
                EnrollState::Done(id) => println!("Enrolled as id {} with {} samples", id, report.captured),
                EnrollState::Cancelled => {
                    println!("Enrollment cancelled, nothing was saved");
                    return Ok(ExitCode::FAILURE);
                }
                other => {
                    println!("Enrollment did not complete ({:?})", other);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Auth => {
            let gate = FaceGate::open(config, &dev_mode)?;
            let camera_config = gate.config().camera.clone();

            let report = run_interactive(move |notifier, cancel| {
                let mut camera = V4l2Camera::open(&camera_config)?;
                gate.authenticate(&mut camera, &notifier, &cancel)
            })?;

            return Ok(match report.state {
                AuthState::Succeeded(success) => {
                    println!(
                        "Authentication: SUCCESS ({}, distance {:.2}, attempt {})",
                        success.name, success.distance, success.attempt
                    );
                    ExitCode::SUCCESS
                }
                AuthState::Failed(reason) => {
                    println!("Authentication: FAILED ({})", reason);
                    ExitCode::FAILURE
                }
                _ => {
                    println!("Authentication: CANCELLED");
                    ExitCode::FAILURE
                }
            });
        }
        Commands::List => {
            let gate = FaceGate::open(config, &dev_mode)?;
            let identities = gate.identities()?;
            if identities.is_empty() {
                println!("No identities enrolled.");
            } else {
                println!("{:>4}  {:<24}  {}", "ID", "NAME", "ENROLLED");
                for identity in &identities {
                    println!(
                        "{:>4}  {:<24}  {}",
                        identity.id,
                        identity.display_name,
                        identity.enrolled_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            if gate.is_model_stale()? {
                println!("\nWarning: the model still knows deleted identities. Run `facegate retrain`.");
            }
        }
        Commands::Rename { id, name } => {
            let gate = FaceGate::open(config, &dev_mode)?;
            gate.rename_identity(id, &name)?;
            println!("Identity {} renamed to {}", id, name.trim());
        }
        Commands::Delete { id } => {
            let gate = FaceGate::open(config, &dev_mode)?;
            let deleted = gate.delete_identity(id)?;
            println!(
                "Deleted {} (id {}), {} samples removed",
                deleted.identity.display_name, deleted.identity.id, deleted.samples_removed
            );
            println!("The model can still recognise this face until you run `facegate retrain`.");
        }
        Commands::Retrain => {
            let gate = FaceGate::open(config, &dev_mode)?;
            let samples = gate.retrain()?;
            if samples == 0 {
                println!("No identities left, model removed");
            } else {
                println!("Model retrained on {} samples", samples);
            }
        }
        Commands::Logs { clear } => {
            let log = FileAuditLog::new(dev_mode.audit_log_path(&config));
            if clear {
                log.clear()?;
                println!("Security log cleared");
            } else {
                let entries = log.entries()?;
                if entries.is_empty() {
                    println!("Security log is empty ({})", log.path().display());
                }
                for entry in entries {
                    println!("{}", entry);
                }
            }
        }
        Commands::ListCameras => list_cameras(&config)?,
        Commands::TestCamera => {
            let mut camera = V4l2Camera::open(&config.camera)?;
            let frame = snapshot(&mut camera)?;
            let path = dev_mode.get_capture_path("capture");
            frame.save(&path).with_context(|| format!("Failed to save {}", path.display()))?;
            println!(
                "Captured {}x{} frame from /dev/video{}, saved to {}",
                frame.width(),
                frame.height(),
                camera.index(),
                path.display()
            );
        }
        Commands::TestDetection => {
            let detector = HaarCascadeDetector::load(&config.detector.cascade_path, config.detector_params())?;
            let mut camera = V4l2Camera::open(&config.camera)?;
            let frame = snapshot(&mut camera)?;

            let faces = detector.detect(&frame);
            println!("Detected {} face(s)", faces.len());
            for (i, face) in faces.iter().enumerate() {
                println!("  #{}: {}x{} at ({}, {})", i + 1, face.width, face.height, face.x, face.y);
            }

            let path = dev_mode.get_capture_path("detection");
            annotate_detections(&frame, &faces)
                .save(&path)
                .with_context(|| format!("Failed to save {}", path.display()))?;
            println!("Annotated frame saved to {}", path.display());
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn snapshot(camera: &mut V4l2Camera) -> Result<image::GrayImage> {
    for _ in 0..SNAPSHOT_TRIES {
        if let Some(frame) = camera.grab()? {
            return Ok(frame);
        }
    }
    anyhow::bail!("No frame from the camera after {} tries", SNAPSHOT_TRIES)
}

fn list_cameras(config: &Config) -> Result<()> {
    let cameras = camera::list_all_cameras()?;
    if cameras.is_empty() {
        println!("No cameras found!");
        println!("\nTroubleshooting:");
        println!("  1. Check if cameras are connected");
        println!("  2. Ensure you have permission to access /dev/video*");
        return Ok(());
    }

    for camera in &cameras {
        let marker = if camera.likely_ir { " [IR]" } else { "" };
        println!("/dev/video{}: {}{}", camera.index, camera.name, marker);
        for feature in &camera.features {
            println!("   - {}", feature);
        }
    }

    println!();
    let auto = camera::detect_ir_camera()?;
    println!("Auto-detect (device_index = {}) picks /dev/video{}", camera::AUTO_DETECT_INDEX, auto);
    println!("Configured device_index: {}", config.camera.device_index);
    Ok(())
}

fn setup_logging(dev_mode: bool) {
    // Logs go to stderr so they do not interleave with the session output.
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(std::io::stderr)
            .init();
    }
}
