use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod import;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll(&self, identity: &str, roll: &str, image: &[u8]) -> zbus::Result<String>;
    async fn recognize(&self, image: &[u8]) -> zbus::Result<String>;
    async fn mark_period(&self, identity: &str, period: u32, image: &[u8]) -> zbus::Result<String>;
    async fn diagnose(&self, image: &[u8]) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<u32>;
    async fn upsert_student(&self, identity: &str, name: &str, roll: &str) -> zbus::Result<()>;
    async fn set_schedule(&self, schedule_json: &str) -> zbus::Result<()>;
    async fn schedule(&self, date: &str) -> zbus::Result<String>;
    async fn attendance(&self, identity: &str, date: &str) -> zbus::Result<String>;
    async fn attendance_on(&self, date: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus (also ROLLCALL_SESSION_BUS=1)
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face for a roster identity
    Enroll {
        identity: String,
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
        /// Roll number to store with the profile (defaults to the roster's)
        #[arg(long)]
        roll: Option<String>,
    },
    /// Recognize a face and log a walk-up attendance event
    Recognize { image: PathBuf },
    /// Mark attendance for a scheduled period
    Mark {
        identity: String,
        #[arg(short, long)]
        period: u32,
        image: PathBuf,
    },
    /// Report image quality measurements without enrolling or matching
    Diagnose { image: PathBuf },
    /// Show daemon status
    Status,
    /// Rebuild the match index from stored profiles
    Reload,
    /// Add or update one roster entry
    Student {
        identity: String,
        name: String,
        #[arg(long)]
        roll: Option<String>,
    },
    /// Import a roster TOML file
    ImportRoster { file: PathBuf },
    /// Import a schedule TOML file (one date)
    ImportSchedule { file: PathBuf },
    /// Show the schedule for a date
    Schedule {
        /// YYYY-MM-DD, defaults to today (UTC)
        #[arg(long)]
        date: Option<String>,
    },
    /// Show attendance for a date, optionally for one identity
    Attendance {
        #[arg(long)]
        identity: Option<String>,
        /// YYYY-MM-DD, defaults to today (UTC)
        #[arg(long)]
        date: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let session = cli.session
        || std::env::var("ROLLCALL_SESSION_BUS")
            .map(|v| v != "0")
            .unwrap_or(false);
    tracing::debug!(session, "connecting to rollcalld");
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    };
    let conn = conn.context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Enroll {
            identity,
            image,
            roll,
        } => {
            let bytes = read_image(&image)?;
            let reply = proxy
                .enroll(&identity, roll.as_deref().unwrap_or(""), &bytes)
                .await?;
            print_json(&reply);
        }
        Commands::Recognize { image } => {
            let reply = proxy.recognize(&read_image(&image)?).await?;
            print_json(&reply);
        }
        Commands::Mark {
            identity,
            period,
            image,
        } => {
            let reply = proxy
                .mark_period(&identity, period, &read_image(&image)?)
                .await?;
            print_json(&reply);
        }
        Commands::Diagnose { image } => {
            let reply = proxy.diagnose(&read_image(&image)?).await?;
            print_json(&reply);
        }
        Commands::Status => print_json(&proxy.status().await?),
        Commands::Reload => {
            let count = proxy.reload().await?;
            println!("{count} profiles indexed");
        }
        Commands::Student {
            identity,
            name,
            roll,
        } => {
            proxy
                .upsert_student(&identity, &name, roll.as_deref().unwrap_or(""))
                .await?;
            println!("{identity} saved");
        }
        Commands::ImportRoster { file } => {
            let roster = import::parse_roster(&read_text(&file)?)?;
            for s in &roster.students {
                proxy
                    .upsert_student(&s.id, &s.name, s.roll.as_deref().unwrap_or(""))
                    .await
                    .with_context(|| format!("saving student {}", s.id))?;
            }
            println!("{} students imported", roster.students.len());
        }
        Commands::ImportSchedule { file } => {
            let json = import::parse_schedule(&read_text(&file)?)?;
            proxy.set_schedule(&json).await?;
            println!("schedule imported");
        }
        Commands::Schedule { date } => {
            let reply = proxy.schedule(&date.unwrap_or_else(today)).await?;
            print_json(&reply);
        }
        Commands::Attendance { identity, date } => {
            let date = date.unwrap_or_else(today);
            let reply = match identity {
                Some(id) => proxy.attendance(&id, &date).await?,
                None => proxy.attendance_on(&date).await?,
            };
            print_json(&reply);
        }
    }

    Ok(())
}

fn today() -> String {
    chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{reply}"),
        },
        Err(_) => println!("{reply}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_mark_arguments() {
        let cli = Cli::try_parse_from(["rollcall", "mark", "S1", "--period", "2", "face.jpg"]).unwrap();
        match cli.command {
            Commands::Mark {
                identity, period, ..
            } => {
                assert_eq!(identity, "S1");
                assert_eq!(period, 2);
            }
            _ => panic!("expected mark"),
        }
        assert!(!cli.session);
    }
}
