//! devpool CLI
//!
//! Tracks which processes belong to which environment and which devices are
//! attached to which environment. Every invocation locks one registry
//! document, reconciles it with the live process table, applies one change
//! and exits.

mod commands;
mod render;

use clap::{Parser, Subcommand};
use commands::gpu::AttachRequest;
use commands::Context;
use devpool_core::{
    ConfigKey, ConfigUpdate, DeviceIndex, DevpoolConfig, DevpoolError, EnvId, Pid,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// devpool - exclusive device allocation for process environments
#[derive(Parser, Debug)]
#[command(name = "devpool")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Skip removing dead processes and stale attachments
    #[arg(long, global = true)]
    no_cleanup: bool,

    /// Recreate the registry document before running the command
    #[arg(long, global = true)]
    reset: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage environments
    #[command(subcommand)]
    Env(EnvCommand),

    /// Manage device attachments
    #[command(subcommand)]
    Gpu(GpuCommand),
}

#[derive(Subcommand, Debug)]
enum EnvCommand {
    /// Add a process to an environment
    Activate {
        /// Process id (defaults to the calling shell)
        #[arg(long)]
        pid: Option<Pid>,

        /// Environment id (defaults to the session id of the process)
        #[arg(long)]
        eid: Option<EnvId>,
    },

    /// Remove a process from its environment
    Deactivate {
        /// Process id (defaults to the calling shell)
        #[arg(long)]
        pid: Option<Pid>,
    },

    /// Set or clear an environment setting
    #[command(subcommand)]
    Config(ConfigCommand),

    /// List environments
    Ps {
        /// Print CSV instead of a table
        #[arg(long)]
        csv: bool,
    },

    /// Print selected fields, one line per environment
    Query {
        /// Only this environment
        #[arg(long)]
        eid: Option<EnvId>,

        /// Comma-separated field names (id, created_at, config.name, config.device_count, uid, username, pids)
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Number of devices the environment wants
    Gpus {
        eid: EnvId,

        #[arg(required_unless_present = "clear")]
        count: Option<u32>,

        /// Remove the setting
        #[arg(long, conflicts_with = "count")]
        clear: bool,
    },

    /// Display name of the environment
    Name {
        eid: EnvId,

        #[arg(required_unless_present = "clear")]
        name: Option<String>,

        /// Remove the setting
        #[arg(long, conflicts_with = "name")]
        clear: bool,
    },
}

#[derive(Subcommand, Debug)]
enum GpuCommand {
    /// Attach devices to an environment
    ///
    /// Without a selector, the environment's configured device count is
    /// ensured.
    Attach {
        eid: EnvId,

        /// Attach exactly these devices
        #[arg(long = "index", conflicts_with_all = ["count", "ensure"])]
        indices: Vec<DeviceIndex>,

        /// Attach this many more free devices
        #[arg(long, conflicts_with = "ensure")]
        count: Option<u32>,

        /// Attach or detach devices until this many are attached
        #[arg(long)]
        ensure: Option<u32>,
    },

    /// Detach an environment from one device or all of them
    Detach {
        eid: EnvId,

        /// Only this device
        #[arg(long)]
        index: Option<DeviceIndex>,
    },

    /// List devices
    Ps {
        /// Print CSV instead of a table
        #[arg(long)]
        csv: bool,
    },

    /// Print selected fields, one line per device
    Query {
        /// Only devices attached to this environment
        #[arg(long)]
        eid: Option<EnvId>,

        /// Comma-separated field names (index, state, eids, attached_at)
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
    },
}

impl ConfigCommand {
    fn into_parts(self) -> (EnvId, ConfigUpdate) {
        match self {
            ConfigCommand::Gpus { eid, count, clear } => match count {
                Some(count) if !clear => (eid, ConfigUpdate::SetDeviceCount(count)),
                _ => (eid, ConfigUpdate::Clear(ConfigKey::DeviceCount)),
            },
            ConfigCommand::Name { eid, name, clear } => match name {
                Some(name) if !clear => (eid, ConfigUpdate::SetName(name)),
                _ => (eid, ConfigUpdate::Clear(ConfigKey::Name)),
            },
        }
    }
}

impl GpuCommand {
    fn attach_request(
        indices: Vec<DeviceIndex>,
        count: Option<u32>,
        ensure: Option<u32>,
    ) -> AttachRequest {
        match (indices.is_empty(), count, ensure) {
            (false, _, _) => AttachRequest::Indices(indices),
            (true, Some(count), _) => AttachRequest::Count(count),
            (true, None, Some(target)) => AttachRequest::Ensure(target),
            (true, None, None) => AttachRequest::Configured,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match DevpoolConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        parse_log_level(&config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "Warning: unknown log level '{}', using warn",
                config.logging.level
            );
            Level::WARN
        })
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let ctx = Context::new(config, !cli.no_cleanup, cli.reset);

    match run(&ctx, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<DevpoolError>() {
                Some(err) if err.is_allocation_error() => eprintln!("{}", err),
                _ => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn parse_log_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

async fn run(ctx: &Context, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Env(command) => match command {
            EnvCommand::Activate { pid, eid } => {
                commands::env::activate(ctx, pid, eid)?;
            }
            EnvCommand::Deactivate { pid } => {
                commands::env::deactivate(ctx, pid)?;
            }
            EnvCommand::Config(config) => {
                let (eid, update) = config.into_parts();
                commands::env::configure(ctx, eid, update)?;
            }
            EnvCommand::Ps { csv } => {
                print!("{}", commands::env::ps(ctx, csv)?);
            }
            EnvCommand::Query { eid, fields } => {
                print!("{}", commands::env::query(ctx, eid, &fields)?);
            }
        },
        Commands::Gpu(command) => match command {
            GpuCommand::Attach {
                eid,
                indices,
                count,
                ensure,
            } => {
                let request = GpuCommand::attach_request(indices, count, ensure);
                let attached = commands::gpu::attach(ctx, eid, request).await?;
                println!("{}", commands::gpu::format_indices(&attached));
            }
            GpuCommand::Detach { eid, index } => {
                commands::gpu::detach(ctx, eid, index).await?;
            }
            GpuCommand::Ps { csv } => {
                print!("{}", commands::gpu::ps(ctx, csv).await?);
            }
            GpuCommand::Query { eid, fields } => {
                print!("{}", commands::gpu::query(ctx, eid, &fields).await?);
            }
        },
    }

    Ok(())
}
