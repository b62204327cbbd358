use anyhow::Result;
use buildsync_core::{ConflictResolver, LinkStatus};
use colored::Colorize;
use std::path::PathBuf;

pub fn run(dir: Option<PathBuf>) -> Result<()> {
    let workspace_dir = super::get_workspace_dir(dir.clone())?;
    if !workspace_dir.join("buildsync.db").exists() {
        println!("{}", "No buildsync workspace found".red());
        println!("Run {} to get started", "buildsync create <name>".cyan());
        return Ok(());
    }

    let workspace = super::Workspace::open(dir)?;
    let store = workspace.store()?;
    let entities = store.list_entities()?;

    println!("{}", "Workspace Status".bold().cyan());
    println!("  {}: {}", "Database".bold(), workspace.db_path().display());
    println!("  {}: {}", "Entities".bold(), entities.len());
    println!(
        "  {}: {}s",
        "Idle window".bold(),
        workspace.config.versioning.idle_window_secs
    );
    println!();

    if entities.is_empty() {
        println!("{}", "No entities yet".yellow());
        return Ok(());
    }

    let mut pending = 0;
    for entity in &entities {
        let latest = store.storage().latest_build(&entity.id)?;
        let is_pending = latest.as_ref().map(|b| !b.finalized).unwrap_or(false);
        if is_pending {
            pending += 1;
        }

        let link = match store.storage().get_link(&entity.id)? {
            Some(link) => {
                let status = match link.status {
                    LinkStatus::Linked => "linked".green(),
                    LinkStatus::Unlinked => "unlinked".dimmed(),
                    LinkStatus::Conflicted => "conflicted".red().bold(),
                };
                format!("{} {}", status, link.path.dimmed())
            }
            None => "local".dimmed().to_string(),
        };

        let icon = if entity.state.removed {
            "-".red()
        } else if is_pending {
            "~".yellow()
        } else {
            " ".normal()
        };

        println!(
            "  {} {:<30} {:>5}  {}",
            icon,
            entity.name,
            format!("v{}", entity.latest_version),
            link
        );
    }
    println!();

    if pending > 0 {
        println!(
            "{} pending build(s); run {} to seal idle ones",
            pending.to_string().yellow(),
            "buildsync finalize".cyan()
        );
    }

    let conflicts = ConflictResolver::new(&store).list_conflicts()?;
    if !conflicts.is_empty() {
        println!(
            "{} conflict(s) awaiting resolution; run {}",
            conflicts.len().to_string().red().bold(),
            "buildsync resolve <entity>".cyan()
        );
    }

    Ok(())
}
