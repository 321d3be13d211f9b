//! Declarative config file loading.
//!
//! The file is a flat document of key/value pairs (TOML, or JSON when the file
//! ends in `.json`) plus three structured entries: the `worker_groups` array,
//! a `worker_defaults` table merged into every worker group, and `users`.

use std::path::Path;

use hyperpod_config::{UserSpec, WorkerGroupSpec};
use serde_json::{Map, Value};

pub const WORKER_GROUPS_KEY: &str = "worker_groups";
pub const WORKER_DEFAULTS_KEY: &str = "worker_defaults";
pub const USERS_KEY: &str = "users";

/// Numeric worker entry fields and the largest value each accepts.
const WORKER_NUMERIC_FIELDS: [(&str, u64); 3] = [
    ("instance_count", u32::MAX as u64),
    ("volume_size_gb", u32::MAX as u64),
    ("threads_per_core", u8::MAX as u64),
];

const WORKER_TEXT_FIELDS: [&str; 3] = ["instance_type", "training_plan", "partition_name"];

/// Alternate worker field spellings and the field they stand for.
const WORKER_ALIASES: [(&str, &str); 2] = [
    ("volume_size", "volume_size_gb"),
    ("capacity_reservation", "training_plan"),
];

/// A loaded config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigDocument {
    values: Map<String, Value>,
}

/// Merge two tables, with `overlay` values taking precedence.
fn merge_values(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(
                    k.clone(),
                    if let Some(base_v) = base_map.get(k) {
                        merge_values(base_v, v)
                    } else {
                        v.clone()
                    },
                );
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

impl ConfigDocument {
    /// Load a config file. `.json` files are parsed as JSON, everything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let doc = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };

        tracing::debug!(
            "Loaded {} config keys from {}",
            doc.values.len(),
            path.display()
        );
        Ok(doc)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let value: Value = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            _ => Err(ConfigError::NotATable),
        }
    }

    /// Scalar value for `key`, rendered as a string.
    ///
    /// Null, blank strings, arrays and tables all count as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// The declared worker groups with `worker_defaults` merged into each entry.
    ///
    /// Returns `Ok(None)` when the file declares no `worker_groups` array.
    pub fn worker_groups(&self) -> Result<Option<Vec<WorkerGroupSpec>>, ConfigError> {
        let Some(raw) = self.values.get(WORKER_GROUPS_KEY) else {
            return Ok(None);
        };
        let Value::Array(entries) = raw else {
            return Err(ConfigError::InvalidEntry {
                key: WORKER_GROUPS_KEY.to_string(),
                reason: "expected an array of tables".to_string(),
            });
        };

        let defaults = self
            .values
            .get(WORKER_DEFAULTS_KEY)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let merged = merge_values(
                    &canonical_worker_keys(&defaults),
                    &canonical_worker_keys(entry),
                );
                let merged = lenient_worker_entry(i, merged);
                serde_json::from_value(merged).map_err(|e| ConfigError::InvalidEntry {
                    key: format!("{WORKER_GROUPS_KEY}[{i}]"),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// The declared users. Entries may be tables or bare usernames.
    pub fn users(&self) -> Result<Option<Vec<UserSpec>>, ConfigError> {
        let Some(raw) = self.values.get(USERS_KEY) else {
            return Ok(None);
        };
        let Value::Array(entries) = raw else {
            return Err(ConfigError::InvalidEntry {
                key: USERS_KEY.to_string(),
                reason: "expected an array".to_string(),
            });
        };

        entries
            .iter()
            .enumerate()
            .map(|(i, entry)| match entry {
                Value::String(name) => Ok(UserSpec {
                    username: name.trim().to_string(),
                    uid: None,
                    home: None,
                }),
                other => serde_json::from_value(other.clone()).map_err(|e| {
                    ConfigError::InvalidEntry {
                        key: format!("{USERS_KEY}[{i}]"),
                        reason: e.to_string(),
                    }
                }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

/// Rename alias fields so an entry and `worker_defaults` spelling the same
/// field differently merge into one key.
fn canonical_worker_keys(entry: &Value) -> Value {
    let Value::Object(fields) = entry else {
        return entry.clone();
    };
    let mut fields = fields.clone();
    for (alias, field) in WORKER_ALIASES {
        if let Some(value) = fields.remove(alias) {
            fields.entry(field).or_insert(value);
        }
    }
    Value::Object(fields)
}

/// Drop worker entry fields whose values cannot be used, so the field default
/// applies. Numbers written as strings are accepted.
fn lenient_worker_entry(index: usize, entry: Value) -> Value {
    let Value::Object(mut fields) = entry else {
        return entry;
    };

    for (field, max) in WORKER_NUMERIC_FIELDS {
        let Some(value) = fields.get(field).cloned() else {
            continue;
        };
        let parsed = match &value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }
        .filter(|n| *n <= max);
        if let Some(n) = parsed {
            fields.insert(field.to_string(), Value::from(n));
        } else {
            tracing::warn!(
                "{WORKER_GROUPS_KEY}[{index}].{field}: invalid value {value}, using the default"
            );
            fields.remove(field);
        }
    }

    for field in WORKER_TEXT_FIELDS {
        if let Some(value) = fields.get(field)
            && !matches!(value, Value::String(_) | Value::Null)
        {
            tracing::warn!("{WORKER_GROUPS_KEY}[{index}].{field}: expected text, got {value}");
            fields.remove(field);
        }
    }

    Value::Object(fields)
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("config file must be a table of key/value pairs")]
    NotATable,
    #[error("invalid config entry {key}: {reason}")]
    InvalidEntry { key: String, reason: String },
}
