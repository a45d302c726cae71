//! File queries against a root's view.
//!
//! Everything that can be rejected is rejected in [`PreparedQuery::prepare`],
//! before the query waits on a cookie.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{WatchdError, WatchdResult};
use crate::watchd::clock::ClockToken;
use crate::watchd::root::Root;
use crate::watchd::sync::{parse_sync_timeout, sync_to_now};
use crate::watchd::view::{FileEntry, View};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Exists,
    Type,
    Size,
    MtimeMs,
}

impl Field {
    fn parse(raw: &str) -> WatchdResult<Self> {
        match raw {
            "name" => Ok(Self::Name),
            "exists" => Ok(Self::Exists),
            "type" => Ok(Self::Type),
            "size" => Ok(Self::Size),
            "mtime_ms" => Ok(Self::MtimeMs),
            other => Err(WatchdError::invalid(format!("unknown field name '{other}'"))),
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Exists => "exists",
            Self::Type => "type",
            Self::Size => "size",
            Self::MtimeMs => "mtime_ms",
        }
    }
}

const DEFAULT_FIELDS: [Field; 5] = [
    Field::Name,
    Field::Exists,
    Field::Type,
    Field::Size,
    Field::MtimeMs,
];

#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub globs: Option<Vec<String>>,
    pub relative_root: Option<String>,
    pub include_dotfiles: bool,
    pub fields: Vec<Field>,
    pub since: Option<ClockToken>,
    pub sync_timeout: Duration,
}

impl QuerySpec {
    pub fn parse(raw: &Value, default_sync_ms: u64) -> WatchdResult<Self> {
        let Some(obj) = raw.as_object() else {
            return Err(WatchdError::invalid("query spec must be a json object"));
        };

        let globs = match obj.get("glob") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(pattern) => Ok(pattern.clone()),
                        other => Err(WatchdError::invalid(format!(
                            "glob: expected json string object, got {other}"
                        ))),
                    })
                    .collect::<WatchdResult<Vec<_>>>()?,
            ),
            Some(other) => {
                return Err(WatchdError::invalid(format!(
                    "glob must be an array, got {other}"
                )));
            }
        };

        let relative_root = match obj.get("relative_root") {
            None | Some(Value::Null) => None,
            Some(Value::String(rel)) => Some(rel.clone()),
            Some(other) => {
                return Err(WatchdError::invalid(format!(
                    "relative_root must be a string, got {other}"
                )));
            }
        };

        let include_dotfiles = match obj.get("glob_includedotfiles") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(other) => {
                return Err(WatchdError::invalid(format!(
                    "glob_includedotfiles must be a boolean, got {other}"
                )));
            }
        };

        let fields = match obj.get("fields") {
            None | Some(Value::Null) => DEFAULT_FIELDS.to_vec(),
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .ok_or_else(|| {
                            WatchdError::invalid(format!("fields: expected string, got {item}"))
                        })
                        .and_then(Field::parse)
                })
                .collect::<WatchdResult<Vec<_>>>()?,
            Some(other) => {
                return Err(WatchdError::invalid(format!(
                    "fields must be a non-empty array, got {other}"
                )));
            }
        };

        let since = match obj.get("since") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(raw.parse::<ClockToken>()?),
            Some(other) => {
                return Err(WatchdError::invalid(format!(
                    "since must be a clock string, got {other}"
                )));
            }
        };

        Ok(Self {
            globs,
            relative_root,
            include_dotfiles,
            fields,
            since,
            sync_timeout: parse_sync_timeout(obj.get("sync_timeout"), default_sync_ms)?,
        })
    }
}

/// Normalize a client-supplied relative root to `/`-separated form without
/// leading or trailing separators. `None` if it escapes the root.
pub fn normalize_relative_root(raw: &str) -> Option<String> {
    let unified = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

#[derive(Debug)]
struct Matcher {
    set: Option<GlobSet>,
    dot_patterns: Vec<bool>,
    include_dotfiles: bool,
}

impl Matcher {
    fn build(globs: Option<&[String]>, include_dotfiles: bool) -> WatchdResult<Self> {
        let Some(globs) = globs else {
            return Ok(Self {
                set: None,
                dot_patterns: Vec::new(),
                include_dotfiles,
            });
        };
        let mut builder = GlobSetBuilder::new();
        let mut dot_patterns = Vec::with_capacity(globs.len());
        for pattern in globs {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|err| {
                    WatchdError::invalid(format!("glob: invalid pattern `{pattern}`: {err}"))
                })?;
            builder.add(glob);
            dot_patterns.push(pattern.starts_with('.') || pattern.contains("/."));
        }
        let set = builder
            .build()
            .map_err(|err| WatchdError::invalid(format!("glob: {err}")))?;
        Ok(Self {
            set: Some(set),
            dot_patterns,
            include_dotfiles,
        })
    }

    fn is_match(&self, name: &str) -> bool {
        let Some(set) = &self.set else {
            return true;
        };
        let hidden = name.split('/').any(|part| part.starts_with('.'));
        if self.include_dotfiles || !hidden {
            return set.is_match(name);
        }
        // Wildcards do not match a leading dot; only patterns that spell the
        // dot out may select hidden entries.
        set.matches(name).into_iter().any(|idx| self.dot_patterns[idx])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub clock: String,
    pub files: Vec<Value>,
    pub is_fresh_instance: bool,
}

#[derive(Debug)]
pub struct PreparedQuery {
    spec: QuerySpec,
    matcher: Matcher,
    prefix: Option<String>,
}

impl PreparedQuery {
    /// Validate `spec` against `root` without waiting on anything.
    pub fn prepare(root: &Root, spec: QuerySpec) -> WatchdResult<Self> {
        let prefix = match spec.relative_root.as_deref() {
            None => None,
            Some(raw) => {
                let unknown = || {
                    WatchdError::invalid(format!(
                        "unable to resolve relative_root `{raw}`: check your relative_root"
                    ))
                };
                let rel = normalize_relative_root(raw).ok_or_else(unknown)?;
                if !root.path().join(&rel).is_dir() {
                    return Err(unknown());
                }
                (!rel.is_empty()).then_some(rel)
            }
        };
        let matcher = Matcher::build(spec.globs.as_deref(), spec.include_dotfiles)?;
        Ok(Self {
            spec,
            matcher,
            prefix,
        })
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// Synchronize with the filesystem, then evaluate.
    pub fn run(&self, root: &Root) -> WatchdResult<QueryResult> {
        sync_to_now(root, self.spec.sync_timeout)?;
        let view = root.view();
        let clock = root.token_at(view.ticks());
        let since_ticks = self
            .spec
            .since
            .filter(|since| since.same_instance(&clock))
            .map(|since| since.ticks);
        Ok(QueryResult {
            clock: clock.to_string(),
            files: self.files(&view, since_ticks),
            is_fresh_instance: since_ticks.is_none(),
        })
    }

    /// Matching entries, sorted by name. With `since_ticks`, only entries
    /// changed after that tick, deletions included.
    pub fn files(&self, view: &View, since_ticks: Option<u64>) -> Vec<Value> {
        let mut out = Vec::new();
        for (path, entry) in view.entries() {
            match since_ticks {
                Some(ticks) if entry.otime <= ticks => continue,
                None if !entry.exists => continue,
                _ => {}
            }
            let name = match &self.prefix {
                Some(prefix) => match path
                    .strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                {
                    Some(rest) => rest,
                    None => continue,
                },
                None => path.as_str(),
            };
            if self.matcher.is_match(name) {
                out.push(self.render(name, entry));
            }
        }
        out
    }

    fn render(&self, name: &str, entry: &FileEntry) -> Value {
        if self.spec.fields == [Field::Name] {
            return Value::String(name.to_string());
        }
        let mut obj = Map::new();
        for field in &self.spec.fields {
            let value = match field {
                Field::Name => Value::from(name),
                Field::Exists => Value::from(entry.exists),
                Field::Type => serde_json::to_value(entry.kind).unwrap_or(Value::Null),
                Field::Size => Value::from(entry.size),
                Field::MtimeMs => Value::from(entry.mtime_ms),
            };
            obj.insert(field.key().to_string(), value);
        }
        Value::Object(obj)
    }
}
