//! `corral session` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use sqlx::SqlitePool;

use corral_db::queries::sessions;

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Show one session row
    Show {
        /// Session id
        session_id: String,
    },
    /// List sessions recorded for a task, newest first
    List {
        /// Task id
        task_id: String,
    },
}

pub async fn run(pool: &SqlitePool, command: SessionCommands) -> Result<()> {
    match command {
        SessionCommands::Show { session_id } => {
            let session = sessions::get_session(pool, &session_id)
                .await?
                .context("session not found")?;
            println!("{}", serde_json::to_string_pretty(&session)?);
            Ok(())
        }
        SessionCommands::List { task_id } => {
            let all = sessions::list_sessions_for_task(pool, &task_id).await?;
            if all.is_empty() {
                println!("no sessions");
                return Ok(());
            }
            for session in all {
                println!(
                    "{}  {}  {}  {}",
                    session.id,
                    session.status,
                    session.created_at.to_rfc3339(),
                    session.title
                );
            }
            Ok(())
        }
    }
}
