use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use shift_core::{EnvironmentRef, TenantId};
use tokio_util::sync::CancellationToken;
use tracing::warn;

mod commands;

#[derive(Parser)]
#[command(
    name = "shift",
    about = "Shift — move multisite tenants between hosted sites",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Configuration file; a missing file means all defaults.
    #[arg(short, long, global = true, default_value = "shift.toml")]
    config: PathBuf,
    /// Log line format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Move tenants: tables, routing row, then files.
    ///
    /// Several tenants run as independent pipelines, at most --jobs at a
    /// time.
    Move {
        /// Source environment, `<site>.<stage>`
        source: EnvironmentRef,
        /// Destination environment, `<site>.<stage>`
        dest: EnvironmentRef,
        /// Tenant ids (blog ids)
        #[arg(required = true)]
        tenants: Vec<TenantId>,
        /// Overwrite tables the destination already has for a tenant
        #[arg(long)]
        force: bool,
        /// Move the database only
        #[arg(long)]
        skip_files: bool,
        /// Tenants moved in parallel (default: [batch].max_parallel)
        #[arg(short, long)]
        jobs: Option<usize>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Tenant file operations
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },
    /// Allocate per-site identifier ranges for every site of an upstream.
    ///
    /// Without --apply the plan is printed and nothing is written to the
    /// sites; allocations are still recorded in the ledger.
    Coordinate {
        /// Upstream id the sites were created from
        upstream: String,
        /// Stage to probe, e.g. `live`
        stage: String,
        /// Table whose identifiers are coordinated
        table: String,
        /// Identifier column of the table
        #[arg(long, default_value = "ID")]
        column: String,
        /// Raise each site's AUTO_INCREMENT into its range
        #[arg(long)]
        apply: bool,
        /// Ledger file (default: [coordination].ledger)
        #[arg(long)]
        ledger: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Subcommand)]
enum FilesAction {
    /// Download a tenant's files into local staging
    Get { env: EnvironmentRef, tenant: TenantId },
    /// Upload a tenant's staged files
    Put { env: EnvironmentRef, tenant: TenantId },
    /// Get from one environment, then put to another
    Sync {
        source: EnvironmentRef,
        dest: EnvironmentRef,
        tenant: TenantId,
    },
    /// Delete every remote file of a tenant
    Delete {
        env: EnvironmentRef,
        tenant: TenantId,
        /// Required: this cannot be undone
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("warn,shift=info"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

/// Cancel every running operation on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping child processes");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let config = shift_core::ShiftConfig::load_or_default(&cli.config)?;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Move {
            source,
            dest,
            tenants,
            force,
            skip_files,
            jobs,
            format,
        } => {
            let opts = shift_engine::MoveOptions { force, skip_files };
            commands::moves::run(config, cancel, source, dest, tenants, opts, jobs, format).await
        }
        Commands::Files { action } => match action {
            FilesAction::Get { env, tenant } => {
                commands::files::get(config, cancel, &env, &tenant).await
            }
            FilesAction::Put { env, tenant } => {
                commands::files::put(config, cancel, &env, &tenant).await
            }
            FilesAction::Sync {
                source,
                dest,
                tenant,
            } => commands::files::sync(config, cancel, &source, &dest, &tenant).await,
            FilesAction::Delete { env, tenant, yes } => {
                commands::files::delete(config, cancel, &env, &tenant, yes).await
            }
        },
        Commands::Coordinate {
            upstream,
            stage,
            table,
            column,
            apply,
            ledger,
            format,
        } => {
            commands::coordinate::run(
                config, cancel, &upstream, &stage, &table, &column, apply, ledger, format,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn move_accepts_many_tenants() {
        let cli = Cli::try_parse_from(["shift", "move", "a.live", "b.live", "5", "12", "--jobs", "3"])
            .unwrap();
        match cli.command {
            Commands::Move { tenants, jobs, .. } => {
                assert_eq!(tenants.len(), 2);
                assert_eq!(jobs, Some(3));
            }
            _ => panic!("expected move"),
        }
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["shift", "move", "nodot", "b.live", "5"]).is_err());
        assert!(Cli::try_parse_from(["shift", "files", "get", "a.live", "5;rm"]).is_err());
        assert!(Cli::try_parse_from(["shift", "move", "a.live", "b.live"]).is_err());
    }

    #[test]
    fn global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "shift", "coordinate", "up", "live", "wp_posts", "--apply", "--config", "x.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert!(matches!(cli.command, Commands::Coordinate { apply: true, .. }));
    }
}
