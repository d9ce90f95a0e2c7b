//! Activity reconciliation daemon.
//!
//! `activityd serve` runs the core: a periodic scheduler that keeps
//! activity lifecycle state consistent with wall-clock time (overdue
//! pending activities go missed, activities entering their notification
//! window get a one-time due-soon reminder) and an event socket that
//! pushes every state change to attached subscribers. The remaining
//! subcommands are one-shot mutations and queries against the same store.

mod activity;
mod config;
mod events;
mod mutations;
mod scheduler;
mod store;
#[cfg(unix)]
mod stream;

use activity::{ActivityStatus, RecurrencePattern};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Settings;
use events::EventBus;
use scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::Arc;
use store::{ActivityStore, FileStore};
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "activityd")]
#[command(about = "Deadline tracker with reconciliation scheduler and event push")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Path to a YAML config file (defaults + env overrides otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and event stream until interrupted
    Serve,
    /// Create an activity
    Add {
        title: String,
        /// Deadline, RFC3339 or naive (interpreted in the reference timezone)
        #[arg(long)]
        deadline: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// Due-soon lead time in minutes (5-1440)
        #[arg(long)]
        notify_minutes: Option<i64>,
        /// Recurrence: daily, weekly or monthly
        #[arg(long)]
        recur: Option<String>,
    },
    /// List activities
    List {
        /// Filter: pending, completed or missed
        #[arg(long)]
        status: Option<String>,
    },
    /// Edit fields of an existing activity
    Edit {
        id: Uuid,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// New deadline, RFC3339 or naive (reference timezone)
        #[arg(long)]
        deadline: Option<String>,
        /// Due-soon lead time in minutes (5-1440)
        #[arg(long)]
        notify_minutes: Option<i64>,
    },
    /// Complete an activity (spawns the next occurrence if recurring)
    Complete { id: Uuid },
    /// Suppress due-soon reminders until the given time
    Snooze {
        id: Uuid,
        /// RFC3339 or naive timestamp
        #[arg(long)]
        until: String,
    },
    /// Delete an activity
    Delete { id: Uuid },
    /// Attach to a running daemon's event socket and print events
    #[cfg(unix)]
    Watch,
}

fn parse_status(raw: &str) -> Result<ActivityStatus> {
    match raw {
        "pending" => Ok(ActivityStatus::Pending),
        "completed" => Ok(ActivityStatus::Completed),
        "missed" => Ok(ActivityStatus::Missed),
        other => anyhow::bail!("Unknown status '{}' (expected pending, completed or missed)", other),
    }
}

fn parse_recurrence(raw: &str) -> Result<RecurrencePattern> {
    match raw {
        "daily" => Ok(RecurrencePattern::Daily),
        "weekly" => Ok(RecurrencePattern::Weekly),
        "monthly" => Ok(RecurrencePattern::Monthly),
        other => anyhow::bail!(
            "Unknown recurrence '{}' (expected daily, weekly or monthly)",
            other
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::from_env(),
    };
    let reference_tz = settings.reference_tz()?;

    #[cfg(unix)]
    if matches!(cli.command, Command::Watch) {
        return watch_events(&settings).await;
    }

    let store: Arc<dyn ActivityStore> = Arc::new(
        FileStore::open(settings.data_path.clone(), reference_tz)
            .context("Failed to open activity store")?,
    );
    let bus = EventBus::new();

    match cli.command {
        Command::Serve => serve(store, bus, &settings).await,
        Command::Add {
            title,
            deadline,
            description,
            priority,
            category,
            notify_minutes,
            recur,
        } => {
            let input = mutations::NewActivity {
                title,
                description,
                priority,
                category,
                deadline: Some(store::parse_timestamp(&deadline, reference_tz)?),
                notification_minutes: notify_minutes,
                recurrence: recur.as_deref().map(parse_recurrence).transpose()?,
            };
            let activity = mutations::create(&store, &bus, input).await?;
            println!("{}  {}  due {}", activity.id, activity.title, activity.deadline);
            Ok(())
        }
        Command::List { status } => {
            let activities = match status.as_deref().map(parse_status).transpose()? {
                Some(status) => store.list_by_status(status).await?,
                None => store.list_all().await?,
            };
            for a in activities {
                let reminder = if a.reminded { " (reminded)" } else { "" };
                println!("{}  [{}]  {}  due {}{}", a.id, a.status, a.title, a.deadline, reminder);
            }
            Ok(())
        }
        Command::Edit {
            id,
            title,
            description,
            priority,
            category,
            deadline,
            notify_minutes,
        } => {
            let changes = mutations::ActivityChanges {
                title,
                description,
                priority,
                category,
                deadline: deadline
                    .map(|raw| store::parse_timestamp(&raw, reference_tz))
                    .transpose()?,
                notification_minutes: notify_minutes,
            };
            let activity = mutations::update(&store, &bus, id, changes).await?;
            println!("Updated {} ({})", activity.id, activity.title);
            Ok(())
        }
        Command::Complete { id } => {
            let activity = mutations::complete(&store, &bus, id).await?;
            println!("Completed {} ({})", activity.id, activity.title);
            Ok(())
        }
        Command::Snooze { id, until } => {
            let until = store::parse_timestamp(&until, reference_tz)?;
            let activity = mutations::snooze(&store, &bus, id, until).await?;
            println!("Snoozed {} until {}", activity.id, until);
            Ok(())
        }
        Command::Delete { id } => {
            if mutations::delete(&store, &bus, id).await? {
                println!("Deleted {}", id);
            } else {
                println!("No activity {}", id);
            }
            Ok(())
        }
        #[cfg(unix)]
        Command::Watch => unreachable!("handled before store setup"),
    }
}

/// Runs the scheduler loops and the event stream listener until ctrl-c.
async fn serve(store: Arc<dyn ActivityStore>, bus: EventBus, settings: &Settings) -> Result<()> {
    let scheduler_handle = Scheduler::new(Arc::clone(&store), bus.clone())
        .with_tick_interval(std::time::Duration::from_secs(settings.tick_secs))
        .run();

    #[cfg(unix)]
    let stream_handle = stream::run_listener(bus, settings.socket_path.clone())?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    // Let in-flight scan iterations finish rather than aborting mid-batch.
    scheduler_handle.shutdown().await;
    #[cfg(unix)]
    stream_handle.shutdown().await;

    Ok(())
}

/// Connects to the daemon's event socket and prints one event per line.
#[cfg(unix)]
async fn watch_events(settings: &Settings) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(&settings.socket_path)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to event socket {} (is the daemon running?)",
                settings.socket_path.display()
            )
        })?;

    let (reader, _writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        println!("{}", line);
    }
    Ok(())
}
