mod config;
mod project_cmd;
mod session_cmd;
mod task_cmd;
mod worktree_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::ConfigFile;

#[derive(Parser)]
#[command(name = "corral", about = "Sandboxed AI coding-agent orchestrator")]
struct Cli {
    /// Database path (overrides CORRAL_DATABASE_PATH and the config file)
    #[arg(long, global = true)]
    database_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write the corral config file
    Init {
        /// Database file path to record
        #[arg(long)]
        db_path: Option<String>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database and apply the schema
    DbInit,
    /// Project management
    Project {
        #[command(subcommand)]
        command: project_cmd::ProjectCommands,
    },
    /// Task management and the agent lifecycle
    Task {
        #[command(subcommand)]
        command: task_cmd::TaskCommands,
    },
    /// Session inspection
    Session {
        #[command(subcommand)]
        command: session_cmd::SessionCommands,
    },
    /// Worktree inspection and housekeeping
    Worktree {
        #[command(subcommand)]
        command: worktree_cmd::WorktreeCommands,
    },
    /// Store an API credential for agent runs
    ApiKey {
        /// Credential kind
        #[arg(long, default_value = "anthropic")]
        kind: String,
        /// The token value (prompted for via stdin when omitted)
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("corral=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_path, force } => {
            let path = config::config_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            let mut file = ConfigFile::default();
            file.database.path = db_path;
            config::save_config(&file)?;
            println!("wrote {}", path.display());
            Ok(())
        }
        Commands::DbInit => {
            let db = config::resolve_db(cli.database_path.as_deref())?;
            let _pool = corral_db::pool::open(&db).await?;
            println!("database ready at {}", db.path().display());
            Ok(())
        }
        Commands::Project { command } => {
            let db = config::resolve_db(cli.database_path.as_deref())?;
            let pool = corral_db::pool::open(&db).await?;
            project_cmd::run(&pool, command).await
        }
        Commands::Task { command } => {
            let db = config::resolve_db(cli.database_path.as_deref())?;
            let pool = corral_db::pool::open(&db).await?;
            task_cmd::run(&pool, command).await
        }
        Commands::Session { command } => {
            let db = config::resolve_db(cli.database_path.as_deref())?;
            let pool = corral_db::pool::open(&db).await?;
            session_cmd::run(&pool, command).await
        }
        Commands::Worktree { command } => {
            let db = config::resolve_db(cli.database_path.as_deref())?;
            let pool = corral_db::pool::open(&db).await?;
            worktree_cmd::run(&pool, command).await
        }
        Commands::ApiKey { kind, token } => {
            let db = config::resolve_db(cli.database_path.as_deref())?;
            let pool = corral_db::pool::open(&db).await?;
            let token = match token {
                Some(token) => token,
                None => {
                    use std::io::BufRead;
                    let mut line = String::new();
                    std::io::stdin().lock().read_line(&mut line)?;
                    line.trim().to_string()
                }
            };
            if token.is_empty() {
                anyhow::bail!("empty token");
            }
            corral_db::queries::api_keys::upsert_api_key(&pool, &kind, &token, None).await?;
            println!("stored {kind} credential");
            Ok(())
        }
    }
}
