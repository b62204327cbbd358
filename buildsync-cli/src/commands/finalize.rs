use anyhow::Result;
use colored::Colorize;
use std::path::PathBuf;
use uuid::Uuid;

/// Seals one build, or every pending build past the idle window.
pub fn run(build_id: Option<String>, dir: Option<PathBuf>) -> Result<()> {
    let workspace = super::Workspace::open(dir)?;
    let store = workspace.store()?;

    match build_id {
        Some(id) => {
            let build = store.finalize(&Uuid::parse_str(&id)?)?;
            println!(
                "{} build {} (v{})",
                "✓ Finalized".green().bold(),
                build.id,
                build.version
            );
        }
        None => {
            let finalized = store.finalize_idle()?;
            if finalized.is_empty() {
                println!("{}", "No idle pending builds".yellow());
            } else {
                println!(
                    "{}",
                    format!("✓ Finalized {} build(s)", finalized.len())
                        .green()
                        .bold()
                );
            }
        }
    }

    Ok(())
}
