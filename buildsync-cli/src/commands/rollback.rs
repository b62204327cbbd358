use anyhow::Result;
use buildsync_core::{diff, RollbackManager};
use colored::Colorize;
use std::path::PathBuf;

pub fn run(
    key: String,
    target_version: u32,
    execute: bool,
    author: String,
    dir: Option<PathBuf>,
) -> Result<()> {
    let workspace = super::Workspace::open(dir)?;
    let store = workspace.store()?;
    let entity = super::find_entity(&store, &key)?;
    let manager = RollbackManager::new(&store);

    let target = store.storage().get_build_by_version(&entity.id, target_version)?;
    let preview = manager.preview(&entity.id, target_version)?;

    println!("{}", "Rollback Preview".bold().cyan());
    println!("  {}: {}", "Entity".bold(), entity.name);
    println!(
        "  {}: v{} -> v{}",
        "Versions".bold(),
        entity.latest_version,
        target_version
    );
    println!("  {}: {}", "Target Author".bold(), target.author);
    println!("  {}: {}", "Date".bold(), super::format_time(&target.updated_at));
    println!();

    if preview.is_empty() {
        println!(
            "{}",
            "Already at the target state; an empty rollback build will be recorded".yellow()
        );
    } else {
        println!("{}", "Fields to be restored:".bold());
        for change in &preview.changes {
            println!("  {}", diff::describe(change));
        }
    }
    println!();

    if !execute {
        println!("{}", "This is a preview only.".yellow());
        println!(
            "Run with {} to actually perform the rollback",
            "--execute".cyan()
        );
        return Ok(());
    }

    let build = manager.rollback(&entity.id, target_version, &author)?;
    println!(
        "{}",
        format!(
            "✓ Rolled back {} to v{} as v{}",
            entity.name, target_version, build.version
        )
        .green()
        .bold()
    );

    Ok(())
}
