use anyhow::{bail, Result};
use buildsync_core::diff;
use buildsync_core::{
    ConflictResolver, GitSyncOrchestrator, Repository, Resolution, SyncPhase, VersionStore,
};
use colored::Colorize;
use dialoguer::{Confirm, Select};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where to find the local clone and which id its links carry.
pub struct RepoTarget {
    pub path: PathBuf,
    pub repo_id: Option<String>,
    pub branch: String,
}

fn orchestrator(workspace: &super::Workspace) -> Result<(GitSyncOrchestrator, Arc<Mutex<VersionStore>>)> {
    let store = Arc::new(Mutex::new(workspace.store()?));
    let sync = GitSyncOrchestrator::new(Arc::clone(&store), workspace.config.sync.clone());
    Ok((sync, store))
}

pub fn pull(target: RepoTarget, dir: Option<PathBuf>) -> Result<()> {
    let workspace = super::Workspace::open_or_init(dir)?;
    let repo = super::open_repository(&target.path, target.repo_id, &workspace.config.sync)?;
    let (sync, _store) = orchestrator(&workspace)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message(format!("Pulling {}@{}...", repo.id(), target.branch));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = sync.pull(&repo, &target.branch, &CancellationToken::new());
    spinner.finish_and_clear();
    let report = result?;

    println!(
        "{} {}@{} at {}",
        "Pulled".bold().cyan(),
        report.repo_id,
        report.branch,
        report
            .commit
            .as_deref()
            .map(|c| &c[..c.len().min(10)])
            .unwrap_or("-")
            .yellow()
    );
    println!();

    for change in &report.applied {
        let version = match change.version {
            Some(v) => format!("v{}", v).cyan().to_string(),
            None => "up to date".dimmed().to_string(),
        };
        println!("  {} {} {}", "✓".green(), change.path, version);
    }
    for conflict in &report.conflicts {
        println!("  {} {} {}", "!".red().bold(), conflict.path, "conflict".red());
    }
    for failure in &report.failures {
        println!(
            "  {} {} - {}",
            "✗".red(),
            failure.path.as_deref().unwrap_or("-"),
            failure.error
        );
    }
    println!();

    match report.phase {
        SyncPhase::Completed => println!(
            "{}",
            format!("✓ {} build(s) created", report.builds_created())
                .green()
                .bold()
        ),
        _ => println!(
            "{}",
            format!(
                "⚠ {} build(s) created, {} failure(s)",
                report.builds_created(),
                report.failures.len()
            )
            .yellow()
            .bold()
        ),
    }
    if !report.conflicts.is_empty() {
        println!("Run {} to resolve conflicts", "buildsync resolve <entity>".cyan());
    }

    Ok(())
}

pub fn push(
    target: RepoTarget,
    entities: Vec<String>,
    all: bool,
    dir: Option<PathBuf>,
) -> Result<()> {
    let workspace = super::Workspace::open(dir)?;
    let repo = super::open_repository(&target.path, target.repo_id, &workspace.config.sync)?;
    let (sync, store) = orchestrator(&workspace)?;

    let ids = {
        let store = store.lock().unwrap_or_else(|e| e.into_inner());
        if all {
            store.list_entities()?.into_iter().map(|e| e.id).collect()
        } else {
            let mut ids = Vec::new();
            for key in &entities {
                ids.push(super::find_entity(&store, key)?.id);
            }
            ids
        }
    };
    if ids.is_empty() {
        bail!("Nothing to push. Name entities or pass --all.");
    }

    let outcome = sync.push(&repo, &ids, &target.branch)?;

    match &outcome.commit {
        Some(commit) => println!(
            "{}",
            format!(
                "✓ Pushed {} entit(y/ies) as {}",
                outcome.pushed.len(),
                &commit[..commit.len().min(10)]
            )
            .green()
            .bold()
        ),
        None => println!("{}", "Nothing was pushed".yellow()),
    }
    for failure in &outcome.failures {
        println!(
            "  {} {} - {}",
            "✗".red(),
            failure
                .entity_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            failure.error
        );
    }
    if !outcome.conflicts.is_empty() {
        println!(
            "{} upstream conflict(s). Run {} to resolve them",
            outcome.conflicts.len(),
            "buildsync resolve <entity>".cyan()
        );
    }

    Ok(())
}

pub fn resolve(
    key: String,
    choice: Option<Resolution>,
    author: String,
    dir: Option<PathBuf>,
) -> Result<()> {
    let workspace = super::Workspace::open(dir)?;
    let store = workspace.store()?;
    let entity = super::find_entity(&store, &key)?;
    let resolver = ConflictResolver::new(&store);
    let report = resolver.report(&entity.id)?;

    println!("{} {}", "Conflict on".bold().red(), entity.name.bold());
    println!("  {}: {}", "Path".bold(), report.path);
    println!("  {}: {}", "Remote commit".bold(), report.remote_commit);
    println!();
    println!("{}", "Local changes since last sync:".bold());
    for change in &report.local.changes {
        println!("    {}", diff::describe(change));
    }
    println!("{}", "Remote changes since last sync:".bold());
    for change in &report.remote.changes {
        println!("    {}", diff::describe(change));
    }
    println!();

    let resolution = match choice {
        Some(resolution) => resolution,
        None => {
            let options = ["Keep local state", "Take remote state"];
            let picked = Select::new()
                .with_prompt("How should this conflict be resolved?")
                .items(&options)
                .default(0)
                .interact()?;
            if picked == 0 {
                Resolution::KeepLocal
            } else {
                Resolution::TakeRemote
            }
        }
    };

    if resolution == Resolution::TakeRemote
        && !report.local.is_empty()
        && !Confirm::new()
            .with_prompt("Local changes will be superseded by a new build. Continue?")
            .default(true)
            .interact()?
    {
        println!("{}", "Aborted".yellow());
        return Ok(());
    }

    match resolver.resolve(&entity.id, resolution, &author)? {
        Some(build) => println!(
            "{}",
            format!("✓ Took remote state as v{}", build.version)
                .green()
                .bold()
        ),
        None => println!("{}", "✓ Conflict resolved".green().bold()),
    }

    Ok(())
}

pub fn link(key: String, path: String, target: RepoTarget, dir: Option<PathBuf>) -> Result<()> {
    let workspace = super::Workspace::open(dir)?;
    let repo = super::open_repository(&target.path, target.repo_id, &workspace.config.sync)?;
    let (sync, store) = orchestrator(&workspace)?;
    let entity = {
        let store = store.lock().unwrap_or_else(|e| e.into_inner());
        super::find_entity(&store, &key)?
    };

    let link = sync.link(&entity.id, repo.id(), &target.branch, &path)?;
    println!(
        "{} {} -> {}@{}:{}",
        "✓ Linked".green().bold(),
        entity.name,
        link.repo_id,
        link.branch,
        link.path
    );
    Ok(())
}

pub fn unlink(key: String, dir: Option<PathBuf>) -> Result<()> {
    let workspace = super::Workspace::open(dir)?;
    let (sync, store) = orchestrator(&workspace)?;
    let entity = {
        let store = store.lock().unwrap_or_else(|e| e.into_inner());
        super::find_entity(&store, &key)?
    };

    let link = sync.unlink(&entity.id)?;
    println!(
        "{} {} (was {})",
        "✓ Unlinked".green().bold(),
        entity.name,
        link.path.dimmed()
    );
    Ok(())
}
