//! `corral project` subcommands.

use anyhow::Result;
use clap::Subcommand;
use sqlx::SqlitePool;

use corral_db::models::ProjectConfig;
use corral_db::queries::projects;

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Register a project
    Add {
        /// Project name
        name: String,
        /// Path to the project's git repository
        #[arg(long)]
        path: String,
        /// Branch worktrees are created from
        #[arg(long, default_value = "main")]
        default_branch: String,
        /// Maximum concurrent agents
        #[arg(long, default_value_t = 2)]
        max_agents: i64,
        /// Per-run turn ceiling
        #[arg(long, default_value_t = 50)]
        max_turns: u32,
    },
    /// List registered projects
    List,
    /// Remove a project (refused while sessions are active)
    Remove {
        /// Project id
        project_id: String,
    },
}

pub async fn run(pool: &SqlitePool, command: ProjectCommands) -> Result<()> {
    match command {
        ProjectCommands::Add {
            name,
            path,
            default_branch,
            max_agents,
            max_turns,
        } => {
            let canonical = std::fs::canonicalize(&path)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(path);
            let config = ProjectConfig {
                default_branch,
                max_turns,
                ..Default::default()
            };
            let project =
                projects::insert_project(pool, &name, &canonical, &config, max_agents).await?;
            println!("{}  {}", project.id, project.name);
            Ok(())
        }
        ProjectCommands::List => {
            let all = projects::list_projects(pool).await?;
            if all.is_empty() {
                println!("no projects");
                return Ok(());
            }
            for project in all {
                println!(
                    "{}  {}  {}  max_agents={}",
                    project.id, project.name, project.path, project.max_concurrent_agents
                );
            }
            Ok(())
        }
        ProjectCommands::Remove { project_id } => {
            projects::delete_project(pool, &project_id).await?;
            println!("removed {project_id}");
            Ok(())
        }
    }
}
