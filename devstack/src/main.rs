//! devstack: operator CLI for the agent task pipeline.
//!
//!   devstack add "Login page" --assigned Dev1
//!   devstack update T-001 --status WIP --as Dev1
//!   devstack list [--status TODO]
//!   devstack report
//!   devstack watch [--once]
//!   devstack integrate T-001 --fail "merge conflict in auth.rs"
//!   devstack context show T-001 Dev1

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use devstack_core::config::Config;
use devstack_core::conflict::resolve_integration_failure;
use devstack_core::context::{ContextManager, ConversationTurn, TurnRole};
use devstack_core::dispatch::Dispatcher;
use devstack_core::report::{render_report, render_table};
use devstack_core::store::update;
use devstack_core::watcher::Watcher;
use devstack_core::{
    JsonTaskStore, Mutation, NewTask, Priority, Role, Status, TaskId, TaskStore, TransitionRequest,
};

#[derive(Parser)]
#[command(name = "devstack", about = "Task pipeline for a team of development agents")]
struct Cli {
    /// Config file (default: ./devstack.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Task store file
    #[arg(long, global = true, env = "DEVSTACK_TASKS")]
    tasks: Option<PathBuf>,

    /// Directory for watcher state, contexts and inboxes
    #[arg(long, global = true, env = "DEVSTACK_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a task
    Add(AddArgs),
    /// Change a task's status, assignment, priority or notes in one write
    Update(UpdateArgs),
    /// Print the task table
    List {
        #[arg(long)]
        status: Option<Status>,
    },
    /// Print the markdown status report
    Report {
        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Poll the store and notify agents until ctrl-c
    Watch {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Report the outcome of integrating an approved task
    Integrate(IntegrateArgs),
    /// Block a task that has overrun its time budget
    Timeout {
        id: TaskId,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long = "as", default_value = "Watcher")]
        actor: Role,
    },
    /// Inspect or extend agent conversation contexts
    #[command(subcommand)]
    Context(ContextCommand),
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct AddArgs {
    title: String,
    #[arg(long, default_value = "")]
    description: String,
    /// Implementation notes for the assignee
    #[arg(long, default_value = "")]
    technical_notes: String,
    #[arg(long)]
    assigned: Option<Role>,
    #[arg(long, default_value = "Medium")]
    priority: Priority,
    /// Task ids that must complete first
    #[arg(long = "depends", value_delimiter = ',')]
    depends: Vec<TaskId>,
    #[arg(long = "files", value_delimiter = ',')]
    files: Vec<String>,
}

#[derive(Args)]
struct UpdateArgs {
    id: TaskId,
    /// Acting role
    #[arg(long = "as", default_value = "Human")]
    actor: Role,
    #[arg(long)]
    status: Option<Status>,
    /// Report a passing outcome (tests or integration)
    #[arg(long, conflicts_with = "fail")]
    pass: bool,
    /// Report a failing outcome with details
    #[arg(long)]
    fail: Option<String>,
    /// Reason or note; attached to the transition, or appended on its own
    #[arg(long)]
    note: Option<String>,
    #[arg(long, conflicts_with = "unassign")]
    assign: Option<Role>,
    #[arg(long)]
    unassign: bool,
    #[arg(long)]
    priority: Option<Priority>,
    /// Replace the dependency set (TODO only)
    #[arg(long, value_delimiter = ',')]
    depends: Option<Vec<TaskId>>,
    #[arg(long = "files", value_delimiter = ',')]
    files: Vec<String>,
}

#[derive(Args)]
struct IntegrateArgs {
    id: TaskId,
    #[arg(long, conflicts_with = "fail", required_unless_present = "fail")]
    pass: bool,
    /// Failure description (e.g. the merge conflict)
    #[arg(long)]
    fail: Option<String>,
    #[arg(long = "as", default_value = "DevOps")]
    actor: Role,
}

#[derive(Subcommand)]
enum ContextCommand {
    /// Print the current window
    Show { task: TaskId, agent: Role },
    /// Append a turn
    Append {
        task: TaskId,
        agent: Role,
        content: String,
        #[arg(long, default_value = "user")]
        role: TurnRole,
        /// Token count reported by the model provider
        #[arg(long)]
        tokens: Option<usize>,
    },
    /// Summary of one agent's context, or of every agent on the task
    Summary { task: TaskId, agent: Option<Role> },
    /// Write the markdown conversation log
    Export { task: TaskId, agent: Role },
    /// Archive the context of a finished task
    Archive { task: TaskId, agent: Role },
}

fn init_tracing() -> Result<()> {
    // Use JSON logs when DEVSTACK_LOG_JSON=1, human-readable otherwise
    let json_logs = std::env::var("DEVSTACK_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("devstack=info".parse()?)
        .add_directive("devstack_core=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(tasks) = cli.tasks {
        config.tasks_file = tasks;
    }
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }

    let store = Arc::new(JsonTaskStore::open(&config.tasks_file)?);
    match cli.command {
        Command::Add(args) => add(&store, args),
        Command::Update(args) => update_task(&store, &config, args),
        Command::List { status } => {
            print!("{}", render_table(&store.read()?, status));
            Ok(())
        }
        Command::Report { out } => {
            let report = render_report(&store.read()?, Utc::now());
            match out {
                Some(path) => std::fs::write(&path, report)
                    .with_context(|| format!("writing {}", path.display())),
                None => {
                    print!("{report}");
                    Ok(())
                }
            }
        }
        Command::Watch { once } => watch(store, &config, once).await,
        Command::Integrate(args) => integrate(&store, &config, args),
        Command::Timeout { id, reason, actor } => {
            let reason = reason.unwrap_or_else(|| "exceeded its time budget".to_string());
            let req = TransitionRequest::new(Status::Blocked, actor)
                .with_note(format!("Timed out: {reason}"));
            let t = update(store.as_ref(), &id, &Mutation::Transition(req), config.write_retries)?;
            println!("{} -> {} (v{})", t.id, t.status, t.version);
            Ok(())
        }
        Command::Context(cmd) => context(&store, &config, cmd),
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn add(store: &JsonTaskStore, args: AddArgs) -> Result<()> {
    let task = store.create(args.into_new_task())?;
    println!("Created {}: {}", task.id, task.title);
    Ok(())
}

impl AddArgs {
    fn into_new_task(self) -> NewTask {
        let mut new = NewTask::new(self.title)
            .description(self.description)
            .technical_notes(self.technical_notes)
            .priority(self.priority);
        if let Some(role) = self.assigned {
            new = new.assigned(role);
        }
        for dep in self.depends {
            new = new.depends_on(dep);
        }
        new.files_changed = self.files.into_iter().collect();
        new
    }
}

fn update_task(store: &JsonTaskStore, config: &Config, args: UpdateArgs) -> Result<()> {
    let id = args.id.clone();
    let mutation = args.into_mutation()?;
    let t = update(store, &id, &mutation, config.write_retries)
        .with_context(|| format!("updating {id}"))?;
    let assigned = t.assigned.map(|r| r.as_str()).unwrap_or("-");
    println!("{}: {} assigned={assigned} v{}", t.id, t.status, t.version);
    Ok(())
}

impl UpdateArgs {
    /// Every requested change as one write, so a refused transition leaves
    /// the task untouched.
    fn into_mutation(self) -> Result<Mutation> {
        let mut mutations = Vec::new();
        if let Some(role) = self.assign {
            mutations.push(Mutation::Assign(Some(role)));
        }
        if self.unassign {
            mutations.push(Mutation::Assign(None));
        }
        if let Some(p) = self.priority {
            mutations.push(Mutation::SetPriority(p));
        }
        if let Some(deps) = self.depends {
            mutations.push(Mutation::SetDependencies(deps.into_iter().collect()));
        }
        if !self.files.is_empty() {
            let files: BTreeSet<String> = self.files.into_iter().collect();
            mutations.push(Mutation::RecordFiles(files));
        }
        match self.status {
            Some(to) => {
                let mut req = TransitionRequest::new(to, self.actor);
                if self.pass {
                    req = req.passed();
                }
                if let Some(details) = self.fail {
                    req = req.failed(details);
                }
                if let Some(note) = self.note {
                    req = req.with_note(note);
                }
                mutations.push(Mutation::Transition(req));
            }
            None => {
                if self.pass || self.fail.is_some() {
                    bail!("--pass/--fail only make sense together with --status");
                }
                if let Some(note) = self.note {
                    mutations.push(Mutation::AppendNote {
                        actor: self.actor,
                        note,
                    });
                }
            }
        }
        match mutations.len() {
            0 => bail!("nothing to update"),
            1 => Ok(mutations.remove(0)),
            _ => Ok(Mutation::Batch(mutations)),
        }
    }
}

async fn watch(store: Arc<JsonTaskStore>, config: &Config, once: bool) -> Result<()> {
    let dispatcher = Dispatcher::new(
        config.build_notifier(),
        Duration::from_secs(config.dedupe_window_secs),
    );
    let mut watcher = Watcher::new(store, dispatcher, config.watcher_options())?;
    tracing::info!(
        tasks = %config.tasks_file.display(),
        state = %config.state_dir.display(),
        "Watching task store"
    );
    if once {
        let report = watcher.run_once(Utc::now()).await?;
        println!(
            "events={} delivered={} dropped={} escalated={}{}",
            report.events.len(),
            report.delivered,
            report.dropped,
            report.escalated.len(),
            if report.baselined { " (baseline adopted)" } else { "" }
        );
        return Ok(());
    }
    watcher
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}

fn integrate(store: &JsonTaskStore, config: &Config, args: IntegrateArgs) -> Result<()> {
    match args.fail {
        Some(failure) => {
            let retries = config.write_retries;
            let r = resolve_integration_failure(store, &args.id, args.actor, &failure, retries)?;
            println!("{} -> {}", r.blocked.id, r.blocked.status);
            let verb = if r.created { "Created" } else { "Existing" };
            println!("{verb} remediation task {}: {}", r.remediation.id, r.remediation.title);
        }
        None => {
            let req = TransitionRequest::new(Status::Completed, args.actor).passed();
            let t = update(store, &args.id, &Mutation::Transition(req), config.write_retries)?;
            println!("{} -> {} (v{})", t.id, t.status, t.version);
        }
    }
    Ok(())
}

fn context(store: &JsonTaskStore, config: &Config, cmd: ContextCommand) -> Result<()> {
    let contexts = ContextManager::open(&config.contexts_db_path(), config.token_budget as usize)?
        .with_export_dir(config.conversations_dir())
        .with_retries(config.write_retries);

    match cmd {
        ContextCommand::Show { task, agent } => {
            for turn in contexts.get_window(&task, agent)? {
                println!("[{} ~{}t] {}", turn.role.as_str(), turn.token_count, turn.content);
            }
        }
        ContextCommand::Append {
            task,
            agent,
            content,
            role,
            tokens,
        } => {
            if store.read()?.get(&task).is_none() {
                bail!("task {task} not found");
            }
            let mut turn = ConversationTurn::new(role, content);
            if let Some(n) = tokens {
                turn = turn.with_tokens(n);
            }
            let report = contexts.append(&task, agent, turn)?;
            println!(
                "tokens ~{} / {} evicted={}{}",
                report.token_total,
                config.token_budget,
                report.evicted.len(),
                if report.over_budget { " (over budget)" } else { "" }
            );
        }
        ContextCommand::Summary { task, agent } => match agent {
            Some(agent) => print!("{}", contexts.summary(&task, agent)?),
            None => print!("{}", contexts.shared_summary(&task)?),
        },
        ContextCommand::Export { task, agent } => {
            let path = contexts.export(&task, agent)?;
            println!("{}", path.display());
        }
        ContextCommand::Archive { task, agent } => {
            let snapshot = store.read()?;
            let t = snapshot
                .get(&task)
                .with_context(|| format!("task {task} not found"))?;
            contexts.archive(t, agent)?;
            println!("Archived {task}/{agent}");
        }
    }
    Ok(())
}
