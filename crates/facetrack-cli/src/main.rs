use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

#[zbus::proxy(
    interface = "org.ambient.FaceTrack1",
    default_service = "org.ambient.FaceTrack1",
    default_path = "/org/ambient/FaceTrack1"
)]
trait FaceTrack {
    async fn select_session(&self, payload: &str) -> zbus::Result<String>;
    async fn deselect(&self) -> zbus::Result<String>;
    async fn manual_control(&self, payload: &str) -> zbus::Result<String>;
    async fn register(&self, payload: &str) -> zbus::Result<String>;
    async fn set_mode(&self, payload: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facetrack", about = "Face tracking daemon control CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OverrideAction {
    Start,
    End,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    AiTracking,
    ManualControl,
}

#[derive(Subcommand)]
enum Commands {
    /// Select the users eligible for tracking
    Select {
        /// Session identifier from the companion app
        #[arg(short, long)]
        session: Option<String>,
        /// User ids to select
        #[arg(required = true)]
        users: Vec<String>,
    },
    /// Clear the active session
    Deselect,
    /// Pause or resume tracking for a manual override
    Override {
        #[arg(value_enum)]
        action: OverrideAction,
        /// User requesting the override
        #[arg(short, long)]
        user: Option<String>,
        /// Requested rotation angle in degrees
        #[arg(long)]
        angle: Option<f32>,
        /// Requested override duration in seconds
        #[arg(long)]
        duration: Option<f32>,
    },
    /// Enroll a user from a face image
    Register {
        user_id: String,
        username: String,
        /// Path to the enrollment image (readable by the daemon)
        image: String,
    },
    /// Switch tracking mode
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    let proxy = FaceTrackProxy::new(&conn).await?;

    let reply = match cli.command {
        Commands::Select { session, users } => {
            let payload = json!({ "session_id": session, "selected_user_ids": users });
            proxy.select_session(&payload.to_string()).await?
        }
        Commands::Deselect => proxy.deselect().await?,
        Commands::Override { action, user, angle, duration } => {
            let action = match action {
                OverrideAction::Start => "start",
                OverrideAction::End => "end",
            };
            let payload = json!({
                "action": action,
                "user_id": user,
                "rotation_angle": angle,
                "duration_seconds": duration,
            });
            proxy.manual_control(&payload.to_string()).await?
        }
        Commands::Register { user_id, username, image } => {
            let image_path = std::fs::canonicalize(&image)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(image);
            let payload = json!({ "user_id": user_id, "username": username, "image_path": image_path });
            proxy.register(&payload.to_string()).await?
        }
        Commands::Mode { mode } => {
            let mode = match mode {
                ModeArg::AiTracking => "ai_tracking",
                ModeArg::ManualControl => "manual_control",
            };
            proxy.set_mode(&json!({ "mode": mode }).to_string()).await?
        }
        Commands::Status => proxy.status().await?,
    };

    print_reply(&reply)
}

/// Pretty-print a JSON reply from the daemon.
fn print_reply(reply: &str) -> Result<()> {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) if reply.is_empty() => bail!("daemon returned an empty reply"),
        Err(_) => println!("{reply}"),
    }
    Ok(())
}
