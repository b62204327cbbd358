use anyhow::Result;
use buildsync_core::{BuildSource, EntityState};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

/// Field flags shared by `create` and `edit`.
#[derive(Args, Debug, Default, Clone)]
pub struct StateArgs {
    /// Set the status
    #[arg(long)]
    pub status: Option<String>,

    /// Set the load mode
    #[arg(long)]
    pub load_mode: Option<String>,

    /// Set the category
    #[arg(long)]
    pub category: Option<String>,

    /// Add a label (repeatable)
    #[arg(long = "label")]
    pub labels: Vec<String>,

    /// Remove a label (repeatable)
    #[arg(long = "unlabel")]
    pub unlabels: Vec<String>,

    /// Add a reference (repeatable)
    #[arg(long = "reference")]
    pub references: Vec<String>,

    /// Remove a reference (repeatable)
    #[arg(long = "unreference")]
    pub unreferences: Vec<String>,

    /// Read the body text from a file
    #[arg(long)]
    pub text_file: Option<PathBuf>,

    /// Mark the entity as removed
    #[arg(long, conflicts_with = "restore")]
    pub remove: bool,

    /// Clear the removed flag
    #[arg(long)]
    pub restore: bool,
}

impl StateArgs {
    pub fn apply(&self, mut state: EntityState) -> Result<EntityState> {
        if let Some(status) = &self.status {
            state.status = Some(status.clone());
        }
        if let Some(load_mode) = &self.load_mode {
            state.load_mode = Some(load_mode.clone());
        }
        if let Some(category) = &self.category {
            state.category = Some(category.clone());
        }
        state.labels.extend(self.labels.iter().cloned());
        for label in &self.unlabels {
            state.labels.remove(label);
        }
        state.references.extend(self.references.iter().cloned());
        for reference in &self.unreferences {
            state.references.remove(reference);
        }
        if let Some(path) = &self.text_file {
            let text = std::fs::read_to_string(path)?;
            state.text = (!text.is_empty()).then_some(text);
        }
        if self.remove {
            state.removed = true;
        }
        if self.restore {
            state.removed = false;
        }
        Ok(state)
    }
}

pub fn create(
    name: String,
    fields: StateArgs,
    author: String,
    dir: Option<PathBuf>,
) -> Result<()> {
    let workspace = super::Workspace::open_or_init(dir)?;
    let store = workspace.store()?;

    let state = fields.apply(EntityState::default())?;
    let (entity, build) = store.create_entity(&name, state, BuildSource::Manual, &author)?;

    println!(
        "{} {} {}",
        "✓ Created".green().bold(),
        entity.name.bold(),
        format!("v{}", build.version).cyan()
    );
    println!("  {}: {}", "Entity ID".bold(), entity.id);
    println!("  {}: {} field change(s)", "Diff".bold(), build.diff.len());

    Ok(())
}

pub fn edit(
    key: String,
    fields: StateArgs,
    expected_version: Option<u32>,
    author: String,
    dir: Option<PathBuf>,
) -> Result<()> {
    let workspace = super::Workspace::open(dir)?;
    let store = workspace.store()?;
    let entity = super::find_entity(&store, &key)?;

    let target = fields.apply(entity.state.clone())?;
    if target == entity.state {
        println!("{}", "Nothing to change".yellow());
        return Ok(());
    }

    let expected = expected_version.unwrap_or(entity.latest_version);
    let build = store.edit(&entity.id, expected, &target, &author)?;

    let state = if build.finalized {
        "finalized".green()
    } else {
        "pending".yellow()
    };
    println!(
        "{} {} {} ({})",
        "✓ Updated".green().bold(),
        entity.name.bold(),
        format!("v{}", build.version).cyan(),
        state
    );
    for change in &build.diff.changes {
        println!("    {}", buildsync_core::diff::describe(change));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_args_apply() {
        let base = EntityState::default()
            .with_status("draft")
            .with_labels(["a", "b"]);
        let args = StateArgs {
            status: Some("published".into()),
            labels: vec!["c".into()],
            unlabels: vec!["a".into()],
            remove: true,
            ..StateArgs::default()
        };

        let state = args.apply(base).unwrap();
        assert_eq!(state.status.as_deref(), Some("published"));
        assert_eq!(
            state.labels.iter().cloned().collect::<Vec<_>>(),
            vec!["b".to_string(), "c".to_string()]
        );
        assert!(state.removed);
    }
}
