use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "io.porchlight.Doorbell1",
    default_service = "io.porchlight.Doorbell1",
    default_path = "/io/porchlight/Doorbell1"
)]
trait Doorbell {
    async fn start_detection(&self) -> zbus::Result<()>;
    async fn stop_detection(&self) -> zbus::Result<()>;
    async fn detection_status(&self) -> zbus::Result<String>;
    async fn start_enrollment(&self, name: &str) -> zbus::Result<()>;
    async fn reenroll_person(&self, id: i64) -> zbus::Result<()>;
    async fn cancel_enrollment(&self) -> zbus::Result<bool>;
    async fn enrollment_status(&self) -> zbus::Result<String>;
    async fn list_people(&self) -> zbus::Result<String>;
    async fn rename_person(&self, id: i64, name: &str) -> zbus::Result<()>;
    async fn remove_person(&self, id: i64) -> zbus::Result<bool>;
    async fn history(&self, page: u32, limit: u32, filter: &str, date: &str) -> zbus::Result<String>;
    async fn latest_detection(&self) -> zbus::Result<String>;
    async fn today_summary(&self) -> zbus::Result<String>;
    async fn delete_detection(&self, id: i64) -> zbus::Result<bool>;
    async fn clear_history(&self) -> zbus::Result<u64>;
    async fn get_settings(&self) -> zbus::Result<String>;
    async fn update_settings(&self, json: &str) -> zbus::Result<()>;
    async fn door_status(&self) -> zbus::Result<String>;
    async fn set_locked(&self, locked: bool) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "porchlight", about = "Porchlight doorbell CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Daemon(DaemonCommand),
    /// List V4L2 capture devices (local, no daemon)
    Devices,
    /// Grab one frame to a JPEG (local, no daemon)
    Snapshot {
        /// Device path or still image
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value = "porchlight-snapshot.jpg")]
        output: PathBuf,
        /// Skip CLAHE contrast enhancement
        #[arg(long)]
        raw: bool,
    },
}

/// Commands answered by porchlightd over D-Bus.
#[derive(Subcommand)]
enum DaemonCommand {
    /// Control the detection loop
    Detect {
        #[command(subcommand)]
        action: DetectAction,
    },
    /// Enroll a new person from the camera
    Enroll {
        /// Display name for the new person
        name: String,
        /// Return right after starting instead of following progress
        #[arg(long)]
        no_wait: bool,
    },
    /// Cancel a running enrollment
    CancelEnroll,
    /// Manage enrolled people
    People {
        #[command(subcommand)]
        action: PeopleAction,
    },
    /// Show detection history, newest first
    History {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 9)]
        limit: u32,
        /// all, known or unknown
        #[arg(long, default_value = "all")]
        filter: String,
        /// Only this day (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,
    },
    /// Show the most recent detection
    Latest,
    /// Today's visitor counts
    Today,
    /// Delete one detection event
    DeleteEvent { id: i64 },
    /// Delete all detection history
    ClearHistory,
    /// Show or change recognition settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
    /// Door lock state
    Door {
        #[command(subcommand)]
        action: Option<DoorAction>,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum DetectAction {
    Start,
    Stop,
    Status,
}

#[derive(Subcommand)]
enum PeopleAction {
    List,
    Rename { id: i64, name: String },
    Remove { id: i64 },
    /// Capture new samples for an enrolled person
    Reenroll {
        id: i64,
        #[arg(long)]
        no_wait: bool,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    Set {
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        enroll_secs: Option<u64>,
        #[arg(long)]
        enroll_frames: Option<u32>,
    },
}

#[derive(Subcommand)]
enum DoorAction {
    Status,
    Lock,
    Unlock,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Snapshot { device, output, raw } => snapshot(&device, &output, !raw),
        Commands::Daemon(command) => run_daemon_command(command, cli.system).await,
    }
}

async fn run_daemon_command(command: DaemonCommand, system_bus: bool) -> Result<()> {
    let conn = if system_bus {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = DoorbellProxy::new(&conn)
        .await
        .context("porchlightd not reachable")?;
    tracing::debug!(system_bus, "connected to porchlightd");

    match command {
        DaemonCommand::Detect { action } => match action {
            DetectAction::Start => {
                proxy.start_detection().await?;
                println!("Detection started");
            }
            DetectAction::Stop => {
                proxy.stop_detection().await?;
                println!("Detection stopped");
            }
            DetectAction::Status => print_json(&proxy.detection_status().await?)?,
        },
        DaemonCommand::Enroll { name, no_wait } => {
            proxy.start_enrollment(&name).await?;
            println!("Enrolling {name}: look at the camera");
            if !no_wait {
                follow_enrollment(&proxy).await?;
            }
        }
        DaemonCommand::CancelEnroll => {
            if proxy.cancel_enrollment().await? {
                println!("Enrollment cancelled");
            } else {
                println!("No capture in progress, nothing discarded");
            }
        }
        DaemonCommand::People { action } => match action {
            PeopleAction::List => {
                let people: Value = serde_json::from_str(&proxy.list_people().await?)?;
                let people = people.as_array().cloned().unwrap_or_default();
                if people.is_empty() {
                    println!("No people enrolled");
                }
                for p in people {
                    println!(
                        "{:>4}  {:<24} {} images  enrolled {}",
                        p["id"],
                        p["displayName"].as_str().unwrap_or(""),
                        p["enrollmentImages"].as_array().map_or(0, Vec::len),
                        p["createdAt"].as_str().unwrap_or("")
                    );
                }
            }
            PeopleAction::Rename { id, name } => {
                proxy.rename_person(id, &name).await?;
                println!("Person {id} renamed to {name}");
            }
            PeopleAction::Remove { id } => {
                if proxy.remove_person(id).await? {
                    println!("Person {id} removed");
                } else {
                    bail!("no person with id {id}");
                }
            }
            PeopleAction::Reenroll { id, no_wait } => {
                proxy.reenroll_person(id).await?;
                println!("Re-enrolling person {id}: look at the camera");
                if !no_wait {
                    follow_enrollment(&proxy).await?;
                }
            }
        },
        DaemonCommand::History {
            page,
            limit,
            filter,
            date,
        } => {
            let raw = proxy
                .history(page, limit, &filter, date.as_deref().unwrap_or(""))
                .await?;
            let page_json: Value = serde_json::from_str(&raw)?;
            let entries = page_json["entries"].as_array().cloned().unwrap_or_default();
            for e in &entries {
                println!("{}", format_event(e));
            }
            println!("({} of {} events)", entries.len(), page_json["total"]);
        }
        DaemonCommand::Latest => {
            let latest: Value = serde_json::from_str(&proxy.latest_detection().await?)?;
            if latest.is_null() {
                println!("No detections yet");
            } else {
                println!("{}", format_event(&latest));
            }
        }
        DaemonCommand::Today => {
            let summary: Value = serde_json::from_str(&proxy.today_summary().await?)?;
            println!(
                "Today: {} visitors ({} known, {} unknown)",
                summary["total"], summary["known"], summary["unknown"]
            );
        }
        DaemonCommand::DeleteEvent { id } => {
            if !proxy.delete_detection(id).await? {
                bail!("no detection event with id {id}");
            }
            println!("Event {id} deleted");
        }
        DaemonCommand::ClearHistory => {
            let removed = proxy.clear_history().await?;
            println!("Removed {removed} events");
        }
        DaemonCommand::Settings { action } => match action.unwrap_or(SettingsAction::Show) {
            SettingsAction::Show => print_json(&proxy.get_settings().await?)?,
            SettingsAction::Set {
                threshold,
                interval_ms,
                enroll_secs,
                enroll_frames,
            } => {
                let mut settings: Value = serde_json::from_str(&proxy.get_settings().await?)?;
                if let Some(v) = threshold {
                    settings["distanceThreshold"] = v.into();
                }
                if let Some(v) = interval_ms {
                    settings["sampleIntervalMs"] = v.into();
                }
                if let Some(v) = enroll_secs {
                    settings["enrollmentDurationSec"] = v.into();
                }
                if let Some(v) = enroll_frames {
                    settings["enrollmentTargetFrameCount"] = v.into();
                }
                proxy.update_settings(&settings.to_string()).await?;
                print_json(&proxy.get_settings().await?)?;
            }
        },
        DaemonCommand::Door { action } => {
            let state = match action.unwrap_or(DoorAction::Status) {
                DoorAction::Status => proxy.door_status().await?,
                DoorAction::Lock => proxy.set_locked(true).await?,
                DoorAction::Unlock => proxy.set_locked(false).await?,
            };
            let state: Value = serde_json::from_str(&state)?;
            let locked = state["isLocked"].as_bool().unwrap_or(true);
            println!(
                "Door {} (since {})",
                if locked { "locked" } else { "unlocked" },
                state["lastChangedAt"].as_str().unwrap_or("?")
            );
        }
        DaemonCommand::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn format_event(e: &Value) -> String {
    let who = if e["isKnown"].as_bool().unwrap_or(false) {
        e["matchedName"].as_str().unwrap_or("known").to_string()
    } else {
        "unknown visitor".to_string()
    };
    // Infinite distances serialize as null.
    let confidence = e["distance"]
        .as_f64()
        .map(|d| (1.0 - d).clamp(0.0, 1.0) * 100.0)
        .unwrap_or(0.0);
    format!(
        "{:>6}  {}  {:<24} {:>5.1}%  {}",
        e["id"],
        e["capturedAt"].as_str().unwrap_or(""),
        who,
        confidence,
        e["imageRef"].as_str().unwrap_or("")
    )
}

async fn follow_enrollment(proxy: &DoorbellProxy<'_>) -> Result<()> {
    let mut last_captured = u64::MAX;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status: Value = serde_json::from_str(&proxy.enrollment_status().await?)?;
        let captured = status["captured"].as_u64().unwrap_or(0);
        if captured != last_captured {
            println!("  captured {captured}/{}", status["target"]);
            last_captured = captured;
        }
        match status["state"].as_str() {
            Some("capturing") | Some("finishing") => continue,
            Some("idle") => {
                match status["enrolled"].as_i64() {
                    Some(id) => println!("Enrolled as person {id}"),
                    None => println!("Enrollment cancelled"),
                }
                return Ok(());
            }
            _ => bail!(
                "enrollment failed: {}",
                status["error"].as_str().unwrap_or("unknown error")
            ),
        }
    }
}

fn list_devices() -> Result<()> {
    let devices = porchlight_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn snapshot(device: &str, output: &Path, enhance: bool) -> Result<()> {
    let source = porchlight_hw::source_for(device, enhance)?;
    let mut stream = source.acquire()?;
    let frame = stream.current_frame()?;
    println!(
        "{}: {}x{} frame, mean brightness {:.1}{}",
        source.describe(),
        frame.width,
        frame.height,
        frame.avg_brightness(),
        if frame.is_dark() { " (dark)" } else { "" }
    );
    let img = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
        .context("frame buffer does not match its dimensions")?;
    img.save(output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Saved {}", output.display());
    Ok(())
}
