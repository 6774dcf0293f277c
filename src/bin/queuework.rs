//! Command-line front end for queuework.
//!
//! Usage:
//!   queuework work redis --queue high,default --tries 3 --timeout 120
//!   queuework work --once
//!   queuework restart
//!   queuework migrate
//!   queuework size database --queue emails

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use queuework::{
    CallQueuedHandler, CommandRegistry, EventManager, HandlerRegistry, QueueManager,
    QueueworkConfig, Worker, WorkerOptions, command::CALL_QUEUED_HANDLER, queue::manager,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "queuework")]
#[command(about = "Run and manage queuework job queues")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, value_name = "PATH", help = "TOML configuration file")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Process jobs from one or more queues")]
    Work(WorkArgs),

    #[command(about = "Ask every running worker to restart after its current job")]
    Restart,

    #[command(about = "Create the jobs table for database connections")]
    Migrate {
        #[arg(help = "Connection to migrate; all database connections when omitted")]
        connection: Option<String>,
    },

    #[command(about = "Show the number of jobs on a queue")]
    Size {
        connection: Option<String>,

        #[arg(long, help = "Comma-separated queue names")]
        queue: Option<String>,
    },
}

#[derive(Args)]
struct WorkArgs {
    #[arg(help = "Connection to work; the configured default when omitted")]
    connection: Option<String>,

    #[arg(long, help = "Comma-separated queues, highest priority first")]
    queue: Option<String>,

    #[arg(long, value_name = "SECONDS", help = "Delay before a failed job is retried")]
    delay: Option<u64>,

    #[arg(long, value_name = "MB", help = "Memory limit in megabytes")]
    memory: Option<u64>,

    #[arg(long, value_name = "SECONDS", help = "Seconds a job may run; 0 disables")]
    timeout: Option<u64>,

    #[arg(long, value_name = "SECONDS", help = "Seconds to sleep when no job is available")]
    sleep: Option<u64>,

    #[arg(long, help = "Attempts allowed for jobs that set none; 0 means unlimited")]
    tries: Option<u32>,

    #[arg(long, help = "Process jobs even in maintenance mode")]
    force: bool,

    #[arg(long, help = "Process a single job and exit")]
    once: bool,

    #[arg(long, help = "Exit once every queue is empty")]
    stop_when_empty: bool,

    #[arg(
        long,
        value_name = "PATH",
        help = "The worker stays idle while this file exists"
    )]
    maintenance_file: Option<PathBuf>,
}

impl WorkArgs {
    fn apply(&self, mut options: WorkerOptions) -> WorkerOptions {
        if let Some(delay) = self.delay {
            options.delay = Duration::from_secs(delay);
        }
        if let Some(memory) = self.memory {
            options.memory = memory;
        }
        if let Some(timeout) = self.timeout {
            options.timeout = Duration::from_secs(timeout);
        }
        if let Some(sleep) = self.sleep {
            options.sleep = Duration::from_secs(sleep);
        }
        if let Some(tries) = self.tries {
            options.max_tries = tries;
        }
        options.force |= self.force;
        options.stop_when_empty |= self.stop_when_empty;
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    setup_logging(&config)?;

    match cli.command {
        Commands::Work(args) => {
            let status = work(&config, args).await?;
            std::process::exit(status);
        }
        Commands::Restart => restart(&config).await?,
        Commands::Migrate { connection } => migrate(&config, connection.as_deref()).await?,
        Commands::Size { connection, queue } => {
            size(&config, connection.as_deref(), queue.as_deref()).await?
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<QueueworkConfig> {
    let config = match path {
        Some(path) => QueueworkConfig::from_file(path)
            .with_context(|| format!("Could not load config from {}", path.display()))?
            .with_env_overrides()?,
        None => QueueworkConfig::from_env()?,
    };
    Ok(config)
}

fn setup_logging(config: &QueueworkConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level)
            .with_context(|| format!("Invalid log level {:?}", config.logging.level))?,
    };

    if config.logging.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    }

    Ok(())
}

fn manager_for(config: &QueueworkConfig) -> Arc<QueueManager> {
    Arc::new(QueueManager::from_config(
        config.default.clone(),
        config.connections.clone(),
    ))
}

/// Commands this build can run. Register application commands here.
fn registered_commands() -> CommandRegistry {
    CommandRegistry::new()
}

/// Every job a worker without commands claims would fail, so refuse to start.
fn ensure_commands(commands: &CommandRegistry) -> Result<()> {
    if commands.is_empty() {
        bail!(
            "No commands are registered in this build; \
             embed queuework::Worker with your own handlers to process jobs"
        );
    }
    Ok(())
}

async fn work(config: &QueueworkConfig, args: WorkArgs) -> Result<i32> {
    let manager = manager_for(config);
    let connection = args
        .connection
        .clone()
        .unwrap_or_else(|| config.default.clone());
    let queue = match &args.queue {
        Some(queue) => queue.clone(),
        None => manager
            .connection(Some(&connection))
            .await?
            .default_queue()
            .to_string(),
    };
    let options = args.apply(config.worker.clone());

    let commands = registered_commands();
    ensure_commands(&commands)?;
    let handlers = HandlerRegistry::new().with_handler(
        CALL_QUEUED_HANDLER,
        CallQueuedHandler::new(commands).with_manager(manager.clone()),
    );
    let events = Arc::new(EventManager::new(config.events.clone()));

    let mut worker = Worker::new(manager, Arc::new(handlers), events);
    if let Some(signal) = config.restart.build().await? {
        worker = worker.with_restart_signal(signal);
    }
    if let Some(path) = args.maintenance_file.clone() {
        worker = worker.with_maintenance_check(move || path.exists());
    }

    if args.once {
        worker.run_next_job(&connection, &queue, &options).await;
        return Ok(0);
    }

    #[cfg(unix)]
    let _signals = worker.listen_for_signals()?;

    let exit = worker.daemon(&connection, &queue, &options).await;
    Ok(exit.exit_code())
}

async fn restart(config: &QueueworkConfig) -> Result<()> {
    let Some(signal) = config.restart.build().await? else {
        bail!("No restart marker is configured; set [restart] in the config file");
    };
    let at = signal.request_restart().await?;
    info!("Broadcasting queue restart signal at {}", at);
    println!("Broadcasting queue restart signal.");
    Ok(())
}

async fn migrate(config: &QueueworkConfig, connection: Option<&str>) -> Result<()> {
    let targets: Vec<_> = match connection {
        Some(name) => {
            let Some(target) = config.connections.get(name) else {
                bail!("Queue connection [{}] is not defined", name);
            };
            vec![(name, target)]
        }
        None => config
            .connections
            .iter()
            .map(|(name, target)| (name.as_str(), target))
            .collect(),
    };

    for (name, target) in targets {
        if manager::migrate(name, target)
            .await
            .with_context(|| format!("Migration of connection [{}] failed", name))?
        {
            println!("Migrated connection [{}].", name);
        }
    }
    Ok(())
}

async fn size(config: &QueueworkConfig, connection: Option<&str>, queue: Option<&str>) -> Result<()> {
    let manager = manager_for(config);
    let backend = manager.connection(connection).await?;

    let queues: Vec<String> = match queue {
        Some(queue) => queue
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
        None => vec![backend.default_queue().to_string()],
    };

    for name in queues {
        let count = backend.size(Some(&name)).await?;
        println!("{}: {}", name, count);
    }
    Ok(())
}
