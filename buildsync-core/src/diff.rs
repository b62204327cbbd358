//! Field-level diffing between entity states.
//!
//! Scalar fields produce at most one change each. Set fields produce one
//! change per element added or removed, ordered by element, so that
//! `diff(b, a) == invert(diff(a, b))` holds exactly.

use crate::error::{Error, Result};
use crate::models::{ChangeKind, DiffRecord, EntityState, Field, FieldChange};
use similar::{ChangeTag, TextDiff};

pub fn diff(old: &EntityState, new: &EntityState) -> DiffRecord {
    let mut changes = Vec::new();

    for field in Field::SCALARS {
        let before = old.scalar(field);
        let after = new.scalar(field);
        if before != after {
            changes.push(FieldChange::new(field, before, after));
        }
    }

    for field in Field::SETS {
        let (Some(before), Some(after)) = (old.set_field(field), new.set_field(field)) else {
            continue;
        };
        for element in before.union(after) {
            match (before.contains(element), after.contains(element)) {
                (true, false) => changes.push(FieldChange::new(field, Some(element.clone()), None)),
                (false, true) => changes.push(FieldChange::new(field, None, Some(element.clone()))),
                _ => {}
            }
        }
    }

    DiffRecord { changes }
}

/// Applies `diff` to `state`, checking that every change's previous value
/// matches what is actually there.
pub fn apply(state: &EntityState, diff: &DiffRecord) -> Result<EntityState> {
    let mut next = state.clone();

    for change in &diff.changes {
        if change.field.is_set() {
            let set = next
                .set_field_mut(change.field)
                .ok_or_else(|| mismatch(change.field, "not a set field"))?;
            match change.kind {
                ChangeKind::Added => {
                    let element = change
                        .new
                        .clone()
                        .ok_or_else(|| mismatch(change.field, "added element missing"))?;
                    if !set.insert(element.clone()) {
                        return Err(mismatch(change.field, &format!("'{}' already present", element)));
                    }
                }
                ChangeKind::Removed => {
                    let element = change
                        .old
                        .as_ref()
                        .ok_or_else(|| mismatch(change.field, "removed element missing"))?;
                    if !set.remove(element) {
                        return Err(mismatch(change.field, &format!("'{}' not present", element)));
                    }
                }
                ChangeKind::Modified => {
                    return Err(mismatch(change.field, "set fields only add or remove"));
                }
            }
        } else {
            let current = next.scalar(change.field);
            if current != change.old {
                return Err(mismatch(
                    change.field,
                    &format!("expected {:?}, found {:?}", change.old, current),
                ));
            }
            next.set_scalar(change.field, change.new.clone());
        }
    }

    Ok(next)
}

pub fn invert(diff: &DiffRecord) -> DiffRecord {
    DiffRecord {
        changes: diff
            .changes
            .iter()
            .map(|c| FieldChange {
                field: c.field,
                kind: c.kind.inverse(),
                old: c.new.clone(),
                new: c.old.clone(),
            })
            .collect(),
    }
}

fn mismatch(field: Field, reason: &str) -> Error {
    Error::DiffMismatch {
        field: field.as_str().to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct TextDiffLine {
    pub line_type: DiffLineType,
    pub content: String,
    pub old_line_number: Option<usize>,
    pub new_line_number: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffLineType {
    Context,
    Addition,
    Deletion,
}

/// Line diff of the `text` body for display.
pub fn text_lines(old_text: &str, new_text: &str) -> Vec<TextDiffLine> {
    let diff = TextDiff::from_lines(old_text, new_text);
    let mut lines = Vec::new();
    let mut old_line_num = 1;
    let mut new_line_num = 1;

    for change in diff.iter_all_changes() {
        let (line_type, old_num, new_num) = match change.tag() {
            ChangeTag::Delete => {
                let num = old_line_num;
                old_line_num += 1;
                (DiffLineType::Deletion, Some(num), None)
            }
            ChangeTag::Insert => {
                let num = new_line_num;
                new_line_num += 1;
                (DiffLineType::Addition, None, Some(num))
            }
            ChangeTag::Equal => {
                let old_num = old_line_num;
                let new_num = new_line_num;
                old_line_num += 1;
                new_line_num += 1;
                (DiffLineType::Context, Some(old_num), Some(new_num))
            }
        };

        lines.push(TextDiffLine {
            line_type,
            content: change.to_string(),
            old_line_number: old_num,
            new_line_number: new_num,
        });
    }

    lines
}

/// One-line summary of a change, e.g. `status: draft -> published` or `labels: +core`.
pub fn describe(change: &FieldChange) -> String {
    let name = change.field.as_str();
    if change.field.is_set() {
        return match change.kind {
            ChangeKind::Added => format!("{}: +{}", name, change.new.as_deref().unwrap_or("")),
            _ => format!("{}: -{}", name, change.old.as_deref().unwrap_or("")),
        };
    }
    if change.field == Field::Text {
        return format!("{}: {}", name, change_kind_label(change.kind));
    }
    match change.kind {
        ChangeKind::Added => format!("{}: +{}", name, change.new.as_deref().unwrap_or("")),
        ChangeKind::Removed => format!("{}: -{}", name, change.old.as_deref().unwrap_or("")),
        ChangeKind::Modified => format!(
            "{}: {} -> {}",
            name,
            change.old.as_deref().unwrap_or(""),
            change.new.as_deref().unwrap_or("")
        ),
    }
}

fn change_kind_label(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Added => "added",
        ChangeKind::Removed => "removed",
        ChangeKind::Modified => "modified",
    }
}
