//! `corral worktree` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use sqlx::SqlitePool;

use corral_core::worktree::{MergeOutcome, WorktreeService};
use corral_db::queries::{projects, worktrees};

#[derive(Subcommand)]
pub enum WorktreeCommands {
    /// Show the diff of a worktree branch against its base
    Diff {
        /// Worktree id
        worktree_id: String,
    },
    /// Merge a worktree branch into its base branch
    Merge {
        /// Worktree id
        worktree_id: String,
        /// Commit message for the merge
        #[arg(long)]
        message: Option<String>,
    },
    /// Remove a worktree's directory
    Remove {
        /// Worktree id
        worktree_id: String,
    },
    /// List a project's worktrees
    List {
        /// Project id
        project_id: String,
    },
    /// Clean up worktrees whose directories are gone
    Prune {
        /// Project id
        project_id: String,
    },
}

pub async fn run(pool: &SqlitePool, command: WorktreeCommands) -> Result<()> {
    let service = WorktreeService::new(pool.clone());

    match command {
        WorktreeCommands::Diff { worktree_id } => {
            let diff = service
                .get_diff(&worktree_id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            for file in &diff.files {
                println!(
                    "{:>8}  +{:<5} -{:<5} {}",
                    file.status, file.additions, file.deletions, file.path
                );
            }
            println!(
                "{} file(s) changed, +{} -{}",
                diff.files_changed, diff.total_additions, diff.total_deletions
            );
            Ok(())
        }
        WorktreeCommands::Merge {
            worktree_id,
            message,
        } => {
            let outcome = service
                .merge(&worktree_id, message.as_deref())
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            match outcome {
                MergeOutcome::Merged => println!("merged"),
                MergeOutcome::Conflict { details } => {
                    println!("merge conflict:\n{details}");
                }
            }
            Ok(())
        }
        WorktreeCommands::Remove { worktree_id } => {
            service
                .remove(&worktree_id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("removed {worktree_id}");
            Ok(())
        }
        WorktreeCommands::List { project_id } => {
            let all = worktrees::list_worktrees_for_project(pool, &project_id, None).await?;
            if all.is_empty() {
                println!("no worktrees");
                return Ok(());
            }
            for worktree in all {
                println!(
                    "{}  {}  {}  {}",
                    worktree.id, worktree.status, worktree.branch, worktree.path
                );
            }
            Ok(())
        }
        WorktreeCommands::Prune { project_id } => {
            let project = projects::get_project(pool, &project_id)
                .await?
                .context("project not found")?;
            let changed = service.prune(&project).await?;
            println!("pruned {changed} worktree(s)");
            Ok(())
        }
    }
}
