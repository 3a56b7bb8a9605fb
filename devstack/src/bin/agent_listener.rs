//! agent-listener: follows one role's notification inbox.
//!
//! Every notification is re-checked against the task store before it is
//! passed on. Actionable ones are printed to stdout as JSON lines for the
//! agent runtime; stale and duplicate hints are logged and dropped. A hint
//! that cannot be re-checked, for example while the task file is being
//! edited by hand, is kept and retried on the next tick.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use devstack_core::config::Config;
use devstack_core::inbox::{Inbox, Verdict};
use devstack_core::{JsonTaskStore, Role};

#[derive(Parser)]
#[command(name = "agent-listener", about = "Follow an agent's notification inbox")]
struct Args {
    /// Role whose inbox to follow
    #[arg(long, env = "DEVSTACK_ROLE")]
    role: Role,

    /// Config file (default: ./devstack.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Task store file
    #[arg(long, env = "DEVSTACK_TASKS")]
    tasks: Option<PathBuf>,

    /// Inbox directory (default: <state_dir>/inbox)
    #[arg(long)]
    inbox: Option<PathBuf>,

    /// Replay notifications already in the inbox
    #[arg(long)]
    from_start: bool,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("DEVSTACK_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("agent_listener=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(tasks) = args.tasks {
        config.tasks_file = tasks;
    }
    let dir = args.inbox.unwrap_or_else(|| config.inbox_dir());
    let store = JsonTaskStore::open(&config.tasks_file)?;

    let mut inbox = if args.from_start {
        Inbox::new(&dir, args.role)
    } else {
        Inbox::from_end(&dir, args.role)?
    };
    tracing::info!(
        role = %args.role,
        inbox = %inbox.path().display(),
        "Listening for notifications"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms.max(50)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Listener stopping");
                return Ok(());
            }
            _ = interval.tick() => {}
        }

        let checked = match inbox.drain(&store) {
            Ok(checked) => checked,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read inbox");
                continue;
            }
        };
        for (n, verdict) in checked {
            match verdict {
                Verdict::Actionable(task) => {
                    tracing::info!(
                        task_id = %task.id,
                        status = %task.status,
                        version = task.version,
                        "Task ready"
                    );
                    println!("{}", serde_json::to_string(&n)?);
                }
                Verdict::Duplicate => {
                    tracing::debug!(
                        task_id = %n.task_id,
                        version = n.version,
                        "Duplicate notification"
                    );
                }
                Verdict::Stale { reason } => {
                    tracing::info!(task_id = %n.task_id, %reason, "Ignoring stale notification");
                }
            }
        }
    }
}
