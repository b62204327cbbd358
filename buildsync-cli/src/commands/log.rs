use anyhow::Result;
use buildsync_core::{diff, BuildSource};
use colored::Colorize;
use std::path::PathBuf;

pub fn run(key: String, limit: Option<usize>, dir: Option<PathBuf>) -> Result<()> {
    let workspace = super::Workspace::open(dir)?;
    let store = workspace.store()?;
    let entity = super::find_entity(&store, &key)?;
    let builds = store.list_versions(&entity.id)?;

    println!("{} {}", "Build History for".bold().cyan(), entity.name.bold());
    println!();

    let to_show = limit.unwrap_or(builds.len()).min(builds.len());

    for build in builds.iter().rev().take(to_show) {
        let marker = if build.finalized {
            String::new()
        } else {
            format!(" {}", "(pending)".yellow())
        };
        println!(
            "{} {}{}",
            format!("build v{}", build.version).yellow().bold(),
            build.id.to_string().dimmed(),
            marker
        );
        println!("{}: {}", "Author".bold(), build.author);
        println!("{}: {}", "Date".bold(), super::format_time(&build.updated_at));
        let source = match build.source {
            BuildSource::Manual => "manual".normal(),
            BuildSource::Git => "git".blue(),
        };
        println!("{}: {}", "Source".bold(), source);
        if let Some(target) = build.rollback_of {
            println!("{}: v{}", "Rollback of".bold(), target);
        }
        println!();

        if build.diff.is_empty() {
            println!("    {}", "no field changes".dimmed());
        }
        for change in build.diff.changes.iter().take(8) {
            println!("    {}", diff::describe(change));
        }
        if build.diff.len() > 8 {
            println!(
                "    {} and {} more...",
                "...".dimmed(),
                (build.diff.len() - 8).to_string().dimmed()
            );
        }
        println!();
    }

    if builds.len() > to_show {
        println!(
            "{}",
            format!("... and {} older builds", builds.len() - to_show).dimmed()
        );
        println!("Use {} to see more", "--limit N".cyan());
    }

    Ok(())
}
