use anyhow::Result;
use buildsync_core::frontmatter::{self, FrontmatterFields};
use colored::Colorize;
use std::path::PathBuf;

/// Prints an entity's state at a version, as the file a push would write.
pub fn run(key: String, version: Option<u32>, json: bool, dir: Option<PathBuf>) -> Result<()> {
    let workspace = super::Workspace::open(dir)?;
    let store = workspace.store()?;
    let entity = super::find_entity(&store, &key)?;

    let version = version.unwrap_or(entity.latest_version);
    let state = store.get_contents(&entity.id, version)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    let link = store.storage().get_link(&entity.id)?;

    println!(
        "{} {}",
        entity.name.bold().cyan(),
        format!("v{}", version).yellow()
    );
    if let Some(link) = &link {
        println!(
            "  {}: {}@{}:{} ({})",
            "Linked".bold(),
            link.repo_id,
            link.branch,
            link.path,
            link.status.as_str()
        );
    }
    if state.removed {
        println!("  {}", "removed".red());
    }
    println!("{}", "━".repeat(80).bright_black());

    let extra = link.map(|l| l.extra).unwrap_or_default();
    let fields = FrontmatterFields::from_state(&state, extra);
    print!(
        "{}",
        frontmatter::serialize(&fields, state.text.as_deref().unwrap_or_default())
    );

    Ok(())
}
