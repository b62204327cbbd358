use anyhow::Result;
use buildsync_core::Resolution;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::entity::StateArgs;
use commands::sync::RepoTarget;
use commands::{diff, entity, finalize, log, rollback, serve, show, status, sync};

#[derive(Parser)]
#[command(name = "buildsync")]
#[command(version, about = "Versioned builds kept in sync with git", long_about = None)]
struct Cli {
    /// Workspace directory (defaults to ./.buildsync)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RepoArgs {
    /// Path to the local clone
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Identifier stored on links (defaults to the clone's directory name)
    #[arg(long)]
    repo_id: Option<String>,

    /// Branch to sync with
    #[arg(short, long, default_value = "main")]
    branch: String,
}

impl From<RepoArgs> for RepoTarget {
    fn from(args: RepoArgs) -> Self {
        RepoTarget {
            path: args.repo,
            repo_id: args.repo_id,
            branch: args.branch,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the finalization sweep
    Serve {
        /// Port for the API server
        #[arg(short, long, default_value = "3030")]
        port: u16,

        /// Local clones to expose for pull/push (repeatable)
        #[arg(long = "repo")]
        repos: Vec<PathBuf>,
    },

    /// Create an entity with its first build
    Create {
        name: String,

        #[command(flatten)]
        fields: StateArgs,

        #[arg(short, long, default_value_t = commands::default_author())]
        author: String,
    },

    /// Edit an entity's fields
    Edit {
        /// Entity name or ID
        entity: String,

        #[command(flatten)]
        fields: StateArgs,

        /// Version the edit is based on (defaults to the latest)
        #[arg(long)]
        expected_version: Option<u32>,

        #[arg(short, long, default_value_t = commands::default_author())]
        author: String,
    },

    /// Show build history for an entity
    Log {
        entity: String,

        /// Number of builds to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show an entity's state at a version
    Show {
        entity: String,

        #[arg(short, long)]
        version: Option<u32>,

        /// Print the state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show field differences between two versions
    Diff {
        entity: String,

        from: u32,

        /// Defaults to the latest version
        to: Option<u32>,
    },

    /// Roll an entity back to an earlier version
    Rollback {
        entity: String,

        version: u32,

        /// Actually perform the rollback (without this, just shows preview)
        #[arg(long)]
        execute: bool,

        #[arg(short, long, default_value_t = commands::default_author())]
        author: String,
    },

    /// Pull changed files from the repository into new builds
    Pull {
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Push entities to the repository in one commit
    Push {
        /// Entity names or IDs
        entities: Vec<String>,

        /// Push every entity
        #[arg(long, conflicts_with = "entities")]
        all: bool,

        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Resolve a sync conflict
    Resolve {
        entity: String,

        /// Keep the local state
        #[arg(long, conflicts_with = "take_remote")]
        keep_local: bool,

        /// Take the remote state
        #[arg(long)]
        take_remote: bool,

        #[arg(short, long, default_value_t = commands::default_author())]
        author: String,
    },

    /// Link an entity to a file in the repository
    Link {
        entity: String,

        /// Path of the file inside the repository
        path: String,

        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Stop syncing an entity
    Unlink { entity: String },

    /// Show entities, pending builds and conflicts
    Status,

    /// Finalize a build, or every idle pending build
    Finalize { build_id: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let dir = cli.dir;

    match cli.command {
        Commands::Serve { port, repos } => {
            serve::run(port, repos, dir).await?;
        }
        Commands::Create {
            name,
            fields,
            author,
        } => {
            entity::create(name, fields, author, dir)?;
        }
        Commands::Edit {
            entity,
            fields,
            expected_version,
            author,
        } => {
            entity::edit(entity, fields, expected_version, author, dir)?;
        }
        Commands::Log { entity, limit } => {
            log::run(entity, limit, dir)?;
        }
        Commands::Show {
            entity,
            version,
            json,
        } => {
            show::run(entity, version, json, dir)?;
        }
        Commands::Diff { entity, from, to } => {
            diff::run(entity, from, to, dir)?;
        }
        Commands::Rollback {
            entity,
            version,
            execute,
            author,
        } => {
            rollback::run(entity, version, execute, author, dir)?;
        }
        Commands::Pull { repo } => {
            sync::pull(repo.into(), dir)?;
        }
        Commands::Push {
            entities,
            all,
            repo,
        } => {
            sync::push(repo.into(), entities, all, dir)?;
        }
        Commands::Resolve {
            entity,
            keep_local,
            take_remote,
            author,
        } => {
            let choice = match (keep_local, take_remote) {
                (true, _) => Some(Resolution::KeepLocal),
                (_, true) => Some(Resolution::TakeRemote),
                _ => None,
            };
            sync::resolve(entity, choice, author, dir)?;
        }
        Commands::Link { entity, path, repo } => {
            sync::link(entity, path, repo.into(), dir)?;
        }
        Commands::Unlink { entity } => {
            sync::unlink(entity, dir)?;
        }
        Commands::Status => {
            status::run(dir)?;
        }
        Commands::Finalize { build_id } => {
            finalize::run(build_id, dir)?;
        }
    }

    Ok(())
}
