//! CLI commands

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::core::{ArchivalScoper, StreamResolver};
use crate::db::repositories::initiative::InitiativeRepository;
use crate::db::repositories::task::{TaskFilter, TaskStatus};
use crate::db::{CheckpointRepository, Database, TaskRepository};

#[derive(Parser)]
#[command(name = "taskloom")]
#[command(about = "Persistence and state-coordination engine for multi-agent task orchestration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace id (default: derived from the current directory)
    #[arg(long)]
    workspace: Option<String>,

    /// Database path, overriding workspace resolution
    #[arg(long)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List tasks
    Tasks {
        /// Filter by PRD ID
        #[arg(long)]
        prd_id: Option<String>,

        /// Filter by status
        #[arg(long)]
        status: Option<String>,

        /// Include archived tasks
        #[arg(long)]
        include_archived: bool,
    },

    /// List streams with progress and dependencies
    Streams {
        /// Include fully archived streams
        #[arg(long)]
        include_archived: bool,
    },

    /// Show the stream execution plan (layers, cycles)
    Layers,

    /// Check which active streams declare the given file paths
    Conflicts {
        /// Candidate file paths
        paths: Vec<String>,

        /// Stream to exclude from the check
        #[arg(long)]
        exclude: Option<String>,
    },

    /// List checkpoints for a task, newest first
    Checkpoints {
        /// Task ID
        task_id: String,
    },

    /// Delete expired checkpoints, or all older than a given age
    Cleanup {
        /// Delete checkpoints older than this many minutes
        #[arg(long)]
        older_than_minutes: Option<i64>,

        /// Restrict the age-based sweep to one task
        #[arg(long)]
        task_id: Option<String>,
    },

    /// Archive streamed tasks left over from a previous initiative
    Archive {
        /// Initiative the tasks belonged to
        previous_initiative: String,

        /// Initiative being switched to
        archiving_initiative: String,
    },

    /// Restore an archived stream to default visibility
    Unarchive {
        /// Stream ID
        stream_id: String,
    },

    /// Delete an initiative and everything it owns
    Wipe {
        /// Initiative ID
        initiative_id: String,

        /// Destructive operations require this flag
        #[arg(long)]
        confirm: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let db = match cli.database {
        Some(path) => Database::new(path)?,
        None => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            Database::open_workspace(cli.workspace.as_deref(), &cwd)?
        }
    };

    let task_repo = TaskRepository::new(db.clone());
    let checkpoint_repo = CheckpointRepository::new(db.clone());

    // Create a multi-threaded runtime for CLI operations
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        // Startup sweep of expired checkpoints, per retention contract.
        checkpoint_repo.cleanup_expired(Utc::now()).await?;

        match cli.command {
            Commands::Tasks {
                prd_id,
                status,
                include_archived,
            } => {
                let status = status.map(|s| TaskStatus::from_str(&s)).transpose()?;
                let tasks = task_repo
                    .list(TaskFilter {
                        prd_id,
                        status,
                        include_archived,
                        ..TaskFilter::default()
                    })
                    .await?;

                if tasks.is_empty() {
                    println!("No tasks found");
                } else {
                    for task in tasks {
                        println!(
                            "[{}] {} ({}) - {}{}",
                            task.id.chars().take(8).collect::<String>(),
                            task.title,
                            task.status.as_str(),
                            task.assigned_agent.as_deref().unwrap_or("-"),
                            if task.archived { " [archived]" } else { "" },
                        );
                    }
                }
                Ok(())
            }

            Commands::Streams { include_archived } => {
                let resolver = StreamResolver::new(task_repo);
                let streams = resolver.list(include_archived).await?;

                if streams.is_empty() {
                    println!("No streams found");
                } else {
                    for stream in streams {
                        println!(
                            "{} - {}% ({}/{} tasks) deps: [{}]{}",
                            stream.id,
                            stream.progress_percent(),
                            stream.completed,
                            stream.total,
                            stream.depends_on.join(", "),
                            if stream.archived { " [archived]" } else { "" },
                        );
                    }
                }
                Ok(())
            }

            Commands::Layers => {
                let resolver = StreamResolver::new(task_repo);
                let plan = resolver.execution_layers().await?;

                for (i, layer) in plan.layers.iter().enumerate() {
                    println!("Layer {}: {}", i + 1, layer.join(", "));
                }
                if !plan.unresolved.is_empty() {
                    let cycles = resolver.find_cycles().await?;
                    println!("Unresolved (cyclic): {}", plan.unresolved.join(", "));
                    for cycle in cycles {
                        println!("  cycle: {}", cycle.join(" -> "));
                    }
                }
                Ok(())
            }

            Commands::Conflicts { paths, exclude } => {
                let resolver = StreamResolver::new(task_repo);
                let conflicts = resolver.conflict_check(&paths, exclude.as_deref()).await?;

                if conflicts.is_empty() {
                    println!("No conflicting streams");
                } else {
                    for stream in conflicts {
                        println!("{} declares overlapping files", stream.id);
                    }
                }
                Ok(())
            }

            Commands::Checkpoints { task_id } => {
                let checkpoints = checkpoint_repo.list(&task_id).await?;

                if checkpoints.is_empty() {
                    println!("No checkpoints found");
                } else {
                    for cp in checkpoints {
                        println!(
                            "#{} [{}] {} phase: {} (expires: {})",
                            cp.seq,
                            cp.id.chars().take(8).collect::<String>(),
                            cp.trigger.as_str(),
                            cp.phase.as_deref().unwrap_or("-"),
                            cp.expires_at
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "never".to_string()),
                        );
                    }
                }
                Ok(())
            }

            Commands::Cleanup {
                older_than_minutes,
                task_id,
            } => {
                let removed = match older_than_minutes {
                    Some(minutes) => {
                        checkpoint_repo
                            .cleanup_older_than(minutes, task_id.as_deref())
                            .await?
                    }
                    None => checkpoint_repo.cleanup_expired(Utc::now()).await?,
                };
                println!("Removed {} checkpoints", removed);
                Ok(())
            }

            Commands::Archive {
                previous_initiative,
                archiving_initiative,
            } => {
                let scoper = ArchivalScoper::new(db.clone());
                let archived = scoper
                    .archive_streams(&previous_initiative, &archiving_initiative)
                    .await?;
                println!("Archived {} tasks", archived);
                Ok(())
            }

            Commands::Unarchive { stream_id } => {
                let scoper = ArchivalScoper::new(db.clone());
                let restored = scoper.unarchive_stream(&stream_id).await?;
                println!("Unarchived {} tasks", restored);
                Ok(())
            }

            Commands::Wipe {
                initiative_id,
                confirm,
            } => {
                let repo = InitiativeRepository::new(db.clone());
                let report = repo.wipe(&initiative_id, confirm).await?;
                println!(
                    "Wiped initiative {}: {} tasks, {} prds, {} work products, {} checkpoints",
                    initiative_id,
                    report.tasks,
                    report.prds,
                    report.work_products,
                    report.checkpoints,
                );
                Ok(())
            }
        }
    })
}
