//! Frontmatter header codec for tracked build files.
//!
//! A tracked file starts with a `---` delimited header:
//!
//! ```text
//! ---
//! status: active
//! load_mode: incremental
//! category: finance
//! references: [orders, customers]
//! labels:
//!   - core
//! owner: data-team
//! ---
//! select * from orders
//! ```
//!
//! `status`, `load_mode`, `category`, `references` and `labels` are recognized.
//! Any other key keeps its raw value (including indented continuation lines)
//! and is written back unchanged. Blank lines and `#` comment lines inside the
//! header are not preserved.

use crate::models::EntityState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

const DELIMITER: &str = "---";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}:{line}: {message} (near `{context}`)")]
pub struct FrontmatterError {
    pub path: String,
    pub line: usize,
    pub context: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontmatterFields {
    pub status: Option<String>,
    pub load_mode: Option<String>,
    pub category: Option<String>,
    pub references: BTreeSet<String>,
    pub labels: BTreeSet<String>,
    pub extra: BTreeMap<String, String>,
}

impl FrontmatterFields {
    pub fn from_state(state: &EntityState, extra: BTreeMap<String, String>) -> Self {
        Self {
            status: state.status.clone(),
            load_mode: state.load_mode.clone(),
            category: state.category.clone(),
            references: state.references.clone(),
            labels: state.labels.clone(),
            extra,
        }
    }

    /// Splits into the versioned state (body becomes `text`) and the opaque keys.
    pub fn into_state(self, body: String) -> (EntityState, BTreeMap<String, String>) {
        let state = EntityState {
            text: (!body.is_empty()).then_some(body),
            status: self.status,
            load_mode: self.load_mode,
            category: self.category,
            references: self.references,
            labels: self.labels,
            removed: false,
        };
        (state, self.extra)
    }
}

/// Parses a whole file into its header fields and body.
///
/// Files without a header parse to empty fields and the full contents as body.
pub fn parse(path: &str, contents: &str) -> Result<(FrontmatterFields, String), FrontmatterError> {
    let mut segments = contents.split_inclusive('\n');
    let Some(first) = segments.next() else {
        return Ok((FrontmatterFields::default(), String::new()));
    };
    if strip_eol(first) != DELIMITER {
        return Ok((FrontmatterFields::default(), contents.to_string()));
    }

    let mut offset = first.len();
    let mut header = Vec::new();
    let mut body_start = None;
    for (idx, segment) in segments.enumerate() {
        offset += segment.len();
        let line = strip_eol(segment);
        if line == DELIMITER {
            body_start = Some(offset);
            break;
        }
        header.push((idx + 2, line));
    }

    let Some(body_start) = body_start else {
        return Err(FrontmatterError {
            path: path.to_string(),
            line: 1,
            context: DELIMITER.to_string(),
            message: "unterminated frontmatter block".to_string(),
        });
    };

    let fields = HeaderParser::new(path).parse(&header)?;
    Ok((fields, contents[body_start..].to_string()))
}

/// Writes the header and body back into file contents. Exact left inverse of [`parse`].
pub fn serialize(fields: &FrontmatterFields, body: &str) -> String {
    let mut out = String::new();
    out.push_str(DELIMITER);
    out.push('\n');

    for (key, value) in [
        ("status", &fields.status),
        ("load_mode", &fields.load_mode),
        ("category", &fields.category),
    ] {
        if let Some(value) = value {
            out.push_str(&format!("{}: {}\n", key, quote_scalar(value)));
        }
    }

    for (key, values) in [("references", &fields.references), ("labels", &fields.labels)] {
        if !values.is_empty() {
            let items: Vec<String> = values.iter().map(|v| quote_item(v)).collect();
            out.push_str(&format!("{}: [{}]\n", key, items.join(", ")));
        }
    }

    for (key, raw) in &fields.extra {
        if raw.is_empty() || raw.starts_with('\n') {
            out.push_str(&format!("{}:{}\n", key, raw));
        } else {
            out.push_str(&format!("{}: {}\n", key, raw));
        }
    }

    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(body);
    out
}

fn strip_eol(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Key {
    Status,
    LoadMode,
    Category,
    References,
    Labels,
}

impl Key {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "status" => Some(Key::Status),
            "load_mode" => Some(Key::LoadMode),
            "category" => Some(Key::Category),
            "references" => Some(Key::References),
            "labels" => Some(Key::Labels),
            _ => None,
        }
    }

    fn is_list(self) -> bool {
        matches!(self, Key::References | Key::Labels)
    }
}

enum Current {
    None,
    Known(Key),
    Extra(String),
}

struct HeaderParser<'a> {
    path: &'a str,
    fields: FrontmatterFields,
    seen: BTreeSet<String>,
}

impl<'a> HeaderParser<'a> {
    fn new(path: &'a str) -> Self {
        Self {
            path,
            fields: FrontmatterFields::default(),
            seen: BTreeSet::new(),
        }
    }

    fn parse(mut self, header: &[(usize, &str)]) -> Result<FrontmatterFields, FrontmatterError> {
        let mut current = Current::None;

        for &(line_no, line) in header {
            let trimmed = line.trim();
            if trimmed.is_empty() || (trimmed.starts_with('#') && !is_continuation(line)) {
                continue;
            }

            if is_continuation(line) {
                match &current {
                    Current::None => {
                        return Err(self.error(line_no, line, "continuation line without a key"))
                    }
                    Current::Known(key) if key.is_list() => {
                        let Some(item) = trimmed.strip_prefix('-') else {
                            return Err(self.error(line_no, line, "expected `- item` in list"));
                        };
                        let item = parse_scalar(item.trim())
                            .map_err(|msg| self.error(line_no, line, &msg))?;
                        if let Some(item) = item {
                            self.list_mut(*key).insert(item);
                        }
                    }
                    Current::Known(_) => {
                        return Err(self.error(line_no, line, "unexpected continuation for scalar key"))
                    }
                    Current::Extra(key) => {
                        if let Some(raw) = self.fields.extra.get_mut(key) {
                            raw.push('\n');
                            raw.push_str(line);
                        }
                    }
                }
                continue;
            }

            let Some((name, value)) = line.split_once(':') else {
                return Err(self.error(line_no, line, "expected `key: value`"));
            };
            let name = name.trim();
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(self.error(line_no, line, "invalid key"));
            }
            if !self.seen.insert(name.to_string()) {
                return Err(self.error(line_no, line, &format!("duplicate key `{}`", name)));
            }
            let value = value.trim();

            current = match Key::parse(name) {
                Some(key) if key.is_list() => {
                    let items =
                        parse_list(value).map_err(|msg| self.error(line_no, line, &msg))?;
                    self.list_mut(key).extend(items);
                    Current::Known(key)
                }
                Some(key) => {
                    let parsed =
                        parse_scalar(value).map_err(|msg| self.error(line_no, line, &msg))?;
                    match key {
                        Key::Status => self.fields.status = parsed,
                        Key::LoadMode => self.fields.load_mode = parsed,
                        _ => self.fields.category = parsed,
                    }
                    Current::Known(key)
                }
                None => {
                    self.fields.extra.insert(name.to_string(), value.to_string());
                    Current::Extra(name.to_string())
                }
            };
        }

        Ok(self.fields)
    }

    fn list_mut(&mut self, key: Key) -> &mut BTreeSet<String> {
        match key {
            Key::References => &mut self.fields.references,
            _ => &mut self.fields.labels,
        }
    }

    fn error(&self, line: usize, context: &str, message: &str) -> FrontmatterError {
        FrontmatterError {
            path: self.path.to_string(),
            line,
            context: context.to_string(),
            message: message.to_string(),
        }
    }
}

fn is_continuation(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t') || line.starts_with('-')
}

/// `""`, `~` and `null` are absent; quoted values are unescaped.
fn parse_scalar(value: &str) -> Result<Option<String>, String> {
    if value.is_empty() || value == "~" || value == "null" {
        return Ok(None);
    }
    if let Some(inner) = value.strip_prefix('"') {
        let inner = inner
            .strip_suffix('"')
            .ok_or_else(|| "unterminated quoted value".to_string())?;
        return unescape(inner).map(Some);
    }
    if let Some(inner) = value.strip_prefix('\'') {
        let inner = inner
            .strip_suffix('\'')
            .ok_or_else(|| "unterminated quoted value".to_string())?;
        return Ok(Some(inner.replace("''", "'")));
    }
    Ok(Some(value.to_string()))
}

fn parse_list(value: &str) -> Result<Vec<String>, String> {
    if value.is_empty() || value == "~" || value == "null" {
        return Ok(Vec::new());
    }
    let Some(inner) = value.strip_prefix('[') else {
        return Ok(parse_scalar(value)?.into_iter().collect());
    };
    let inner = inner
        .strip_suffix(']')
        .ok_or_else(|| "unterminated list".to_string())?;

    let mut items = Vec::new();
    let mut token = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in inner.chars() {
        if in_quotes {
            token.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quotes = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_quotes = true;
                token.push(ch);
            }
            ',' => {
                items.extend(parse_scalar(token.trim())?);
                token.clear();
            }
            _ => token.push(ch),
        }
    }
    if in_quotes {
        return Err("unterminated quoted value".to_string());
    }
    items.extend(parse_scalar(token.trim())?);
    Ok(items)
}

fn unescape(inner: &str) -> Result<String, String> {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            if ch == '"' {
                return Err("unescaped quote in value".to_string());
            }
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            other => return Err(format!("invalid escape `\\{}`", other.unwrap_or(' '))),
        }
    }
    Ok(out)
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value == "~"
        || value == "null"
        || value.trim() != value
        || value.starts_with(['"', '\'', '[', '{', '#', '&', '*', '!', '|', '>', '%', '@', '`'])
        || value.contains(": ")
        || value.contains(" #")
        || value.chars().any(|c| c.is_control() || c == '"' || c == '\\')
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

fn quote_scalar(value: &str) -> String {
    if needs_quotes(value) {
        quote(value)
    } else {
        value.to_string()
    }
}

fn quote_item(value: &str) -> String {
    if needs_quotes(value) || value.contains([',', '[', ']']) {
        quote(value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn fields() -> FrontmatterFields {
        FrontmatterFields {
            status: Some("active".into()),
            load_mode: Some("incremental".into()),
            category: Some("finance".into()),
            references: ["orders".to_string(), "customers".to_string()].into(),
            labels: ["core".to_string()].into(),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_parse_inline_and_block_lists() {
        let contents = "---\nstatus: active\nreferences: [orders, \"a, b\"]\nlabels:\n  - core\n  - pii\n---\nselect 1\n";

        let (parsed, body) = parse("models/x.sql", contents).unwrap();

        assert_eq!(parsed.status.as_deref(), Some("active"));
        assert_eq!(
            parsed.references,
            BTreeSet::from(["orders".to_string(), "a, b".to_string()])
        );
        assert_eq!(
            parsed.labels,
            BTreeSet::from(["core".to_string(), "pii".to_string()])
        );
        assert_eq!(body, "select 1\n");
    }

    #[test]
    fn test_no_header_is_all_body() {
        let (parsed, body) = parse("x.sql", "select 1\n").unwrap();
        assert_eq!(parsed, FrontmatterFields::default());
        assert_eq!(body, "select 1\n");
    }

    #[test]
    fn test_unknown_keys_survive_round_trip() {
        let contents = "---\nstatus: draft\nowner: data-team\nschedule:\n  cron: \"0 * * * *\"\n  tz: UTC\n---\nbody\n";

        let (parsed, body) = parse("x.sql", contents).unwrap();
        assert_eq!(parsed.extra.get("owner").map(String::as_str), Some("data-team"));
        assert_eq!(
            parsed.extra.get("schedule").map(String::as_str),
            Some("\n  cron: \"0 * * * *\"\n  tz: UTC")
        );

        let written = serialize(&parsed, &body);
        assert_eq!(parse("x.sql", &written).unwrap(), (parsed, body));
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let mut tricky = fields();
        tricky.status = Some("needs: review".into());
        tricky.category = Some(" padded ".into());
        tricky.labels = ["", "x]y", "quote\"d", "line\nbreak"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        tricky.extra.insert("owner".into(), "team-a".into());
        tricky.extra.insert("empty".into(), String::new());

        let cases = vec![
            (FrontmatterFields::default(), String::new()),
            (FrontmatterFields::default(), "---\nnot a header\n".to_string()),
            (fields(), "select *\nfrom orders\n".to_string()),
            (tricky, "body without newline".to_string()),
        ];

        for (f, b) in cases {
            let written = serialize(&f, &b);
            assert_eq!(parse("x.sql", &written).unwrap(), (f, b));
        }
    }

    #[test]
    fn test_malformed_header_reports_line() {
        let err = parse("models/bad.sql", "---\nstatus: active\nnot a pair\n---\n").unwrap_err();
        assert_eq!(err.path, "models/bad.sql");
        assert_eq!(err.line, 3);
        assert_eq!(err.context, "not a pair");

        let err = parse("x.sql", "---\nstatus: active\n").unwrap_err();
        assert_eq!(err.line, 1);

        let err = parse("x.sql", "---\nlabels: [a, b\n---\n").unwrap_err();
        assert_eq!(err.line, 2);

        let err = parse("x.sql", "---\nstatus: a\nstatus: b\n---\n").unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn test_state_conversion() {
        let (state, extra) = fields().into_state("select 1\n".into());
        assert_eq!(state.text.as_deref(), Some("select 1\n"));
        assert!(extra.is_empty());

        let back = FrontmatterFields::from_state(&state, extra);
        assert_eq!(back, fields());
    }
}
