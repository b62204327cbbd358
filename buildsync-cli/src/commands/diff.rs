use anyhow::Result;
use buildsync_core::diff::{self, DiffLineType};
use buildsync_core::{ChangeKind, Field};
use colored::Colorize;
use std::path::PathBuf;

pub fn run(key: String, from: u32, to: Option<u32>, dir: Option<PathBuf>) -> Result<()> {
    let workspace = super::Workspace::open(dir)?;
    let store = workspace.store()?;
    let entity = super::find_entity(&store, &key)?;

    let to = to.unwrap_or(entity.latest_version);
    let record = store.diff_versions(&entity.id, from, to)?;

    println!(
        "{}",
        format!("Diff for {} v{} -> v{}", entity.name, from, to)
            .bold()
            .cyan()
    );
    println!();

    if record.is_empty() {
        println!("{}", "No differences".green());
        return Ok(());
    }

    for change in &record.changes {
        if change.field == Field::Text {
            println!("{}", "━".repeat(80).bright_black());
            println!("{}", "text".white().bold());
            let old = change.old.as_deref().unwrap_or_default();
            let new = change.new.as_deref().unwrap_or_default();
            for line in diff::text_lines(old, new) {
                let (prefix, color): (&str, fn(&str) -> colored::ColoredString) =
                    match line.line_type {
                        DiffLineType::Addition => ("+", |s| s.green()),
                        DiffLineType::Deletion => ("-", |s| s.red()),
                        DiffLineType::Context => (" ", |s| s.normal()),
                    };
                print!("{}", color(&format!("{}{}", prefix, line.content)));
            }
            println!();
            continue;
        }

        let icon = match change.kind {
            ChangeKind::Added => "+".green(),
            ChangeKind::Removed => "-".red(),
            ChangeKind::Modified => "~".yellow(),
        };
        println!("  {} {}", icon, diff::describe(change));
    }

    Ok(())
}
