use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::{TowerError, TowerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityLevel {
    pub priority: i64,
    pub labels: Vec<String>,
}

/// Candidate labels grouped by priority, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityTable {
    levels: Vec<PriorityLevel>,
}

impl PriorityTable {
    pub fn new(levels: impl IntoIterator<Item = PriorityLevel>) -> Self {
        let mut levels: Vec<PriorityLevel> = levels.into_iter().collect();
        levels.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { levels }
    }

    /// One-element table searched when the caller supplied no table at all.
    pub fn placeholder(label: &str) -> Self {
        Self::new([PriorityLevel {
            priority: 0,
            labels: vec![label.to_string()],
        }])
    }

    pub fn levels(&self) -> &[PriorityLevel] {
        &self.levels
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn label_count(&self) -> usize {
        self.levels.iter().map(|l| l.labels.len()).sum()
    }

    /// Extract the table stored under `key` in a custom parameter block.
    ///
    /// Returns `Ok(None)` when the block or the key is absent (or null).
    /// The block may be an object or a JSON string holding one; the value
    /// under `key` may be JSON text or an already-decoded object.
    pub fn from_custom_param(param: &Value, key: &str) -> TowerResult<Option<Self>> {
        let decoded;
        let outer = match param {
            Value::Null => return Ok(None),
            Value::String(text) if text.trim().is_empty() => return Ok(None),
            Value::String(text) => {
                decoded = serde_json::from_str::<Value>(text).map_err(|e| {
                    TowerError::Config(format!("custom parameter block is not valid JSON: {e}"))
                })?;
                &decoded
            }
            other => other,
        };

        let Value::Object(fields) = outer else {
            return Err(TowerError::Config(format!(
                "custom parameter block must be a JSON object, got {}",
                type_name(outer)
            )));
        };

        let in_key = |e: TowerError| match e {
            TowerError::Config(msg) => TowerError::Config(format!("'{key}': {msg}")),
            other => other,
        };

        match fields.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Self::parse(text).map(Some).map_err(in_key),
            Some(inner @ Value::Object(_)) => Self::from_value(inner).map(Some).map_err(in_key),
            Some(other) => Err(TowerError::Config(format!(
                "'{key}' must be a JSON-encoded priority table, got {}",
                type_name(other)
            ))),
        }
    }

    /// Parse the JSON text of a priority table, e.g. `{"3": ["A", "B"], "2": ["C"]}`.
    pub fn parse(text: &str) -> TowerResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| TowerError::Config(format!("priority table is not valid JSON: {e}")))?;
        Self::from_value(&value)
    }

    fn from_value(value: &Value) -> TowerResult<Self> {
        let Value::Object(entries) = value else {
            return Err(TowerError::Config(format!(
                "priority table must be an object, got {}",
                type_name(value)
            )));
        };

        let mut by_priority: BTreeMap<i64, PriorityLevel> = BTreeMap::new();
        for (key, labels) in entries {
            let priority: i64 = key.trim().parse().map_err(|_| {
                TowerError::Config(format!("priority '{key}' is not an integer"))
            })?;

            let Value::Array(items) = labels else {
                return Err(TowerError::Config(format!(
                    "labels for priority {key} must be an array, got {}",
                    type_name(labels)
                )));
            };

            // Keys spelling the same integer ("3", "03") share one level,
            // labels appended in document order.
            let level = by_priority.entry(priority).or_insert_with(|| PriorityLevel {
                priority,
                labels: Vec::with_capacity(items.len()),
            });
            if !level.labels.is_empty() {
                tracing::debug!(key = %key, priority, "merging labels into existing priority");
            }
            for item in items {
                match item {
                    Value::String(label) => {
                        if label.trim().is_empty() {
                            tracing::warn!(priority, "empty label in priority table, searched as given");
                        }
                        level.labels.push(label.clone());
                    }
                    other => {
                        return Err(TowerError::Config(format!(
                            "priority {key} contains a non-string label ({})",
                            type_name(other)
                        )))
                    }
                }
            }
        }

        Ok(Self::new(by_priority.into_values()))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
