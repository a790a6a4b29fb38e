//! Core domain model for the roster tally: entity profiles, the registry,
//! snapshot records, and cell normalization.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tally-core";

/// Stable internal identity for one participant, surviving id churn and
/// renames in the source exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProfile {
    pub entity_id: Uuid,
    /// Display name at creation time; never auto-changed afterwards.
    pub primary_name: String,
    /// Every raw identifier ever observed, in first-seen order. Append-only.
    pub known_ids: Vec<String>,
    /// Every raw display name ever observed, in first-seen order. Append-only.
    pub known_names: Vec<String>,
    pub current_id: String,
    pub current_name: String,
    /// Event identifiers this entity has appeared under, in first-seen order.
    pub active_events: Vec<String>,
    pub first_seen_event: String,
    pub last_seen_event: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl EntityProfile {
    pub fn new(raw_id: &str, raw_name: &str, event_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: Uuid::new_v4(),
            primary_name: raw_name.to_string(),
            known_ids: vec![raw_id.to_string()],
            known_names: vec![raw_name.to_string()],
            current_id: raw_id.to_string(),
            current_name: raw_name.to_string(),
            active_events: vec![event_id.to_string()],
            first_seen_event: event_id.to_string(),
            last_seen_event: event_id.to_string(),
            created_at: now,
            last_updated: now,
        }
    }

    /// Apply one observation of this entity: grow the known sets if needed,
    /// overwrite the current pair, stamp the last-seen markers.
    pub fn observe(&mut self, raw_id: &str, raw_name: &str, event_id: &str, now: DateTime<Utc>) {
        push_if_absent(&mut self.known_ids, raw_id);
        push_if_absent(&mut self.known_names, raw_name);
        push_if_absent(&mut self.active_events, event_id);
        self.current_id = raw_id.to_string();
        self.current_name = raw_name.to_string();
        self.last_seen_event = event_id.to_string();
        self.last_updated = now;
    }

    pub fn knows_id(&self, raw_id: &str) -> bool {
        self.known_ids.iter().any(|id| id == raw_id)
    }

    pub fn knows_name(&self, raw_name: &str) -> bool {
        self.known_names.iter().any(|name| name == raw_name)
    }
}

fn push_if_absent(set: &mut Vec<String>, value: &str) {
    if !set.iter().any(|existing| existing == value) {
        set.push(value.to_string());
    }
}

/// Run-scoped collection of entity profiles. Loaded wholesale at run start,
/// mutated only in memory, persisted wholesale at run end.
///
/// Profiles keep insertion order: resolution scans them in that order and the
/// first match wins, so the order must survive serialization round-trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    profiles: Vec<EntityProfile>,
}

impl Registry {
    pub fn profiles(&self) -> impl Iterator<Item = &EntityProfile> {
        self.profiles.iter()
    }

    pub fn get(&self, entity_id: &Uuid) -> Option<&EntityProfile> {
        self.profiles.iter().find(|p| p.entity_id == *entity_id)
    }

    pub fn get_mut(&mut self, entity_id: &Uuid) -> Option<&mut EntityProfile> {
        self.profiles.iter_mut().find(|p| p.entity_id == *entity_id)
    }

    pub fn insert(&mut self, profile: EntityProfile) {
        self.profiles.push(profile);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Deterministic identity of one snapshot document. Re-ingesting the same
/// source data lands on the same key and overwrites instead of duplicating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub entity_id: Uuid,
    pub event_id: String,
    pub date_id: NaiveDate,
}

/// One per-date metrics document for one entity within one event. The raw
/// member pair is kept as an audit trail of what the source row contained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub event_id: String,
    pub date_id: NaiveDate,
    pub member_id: String,
    pub member_name: String,
    /// Sparse named metrics; absent or empty source cells are omitted.
    pub metrics: BTreeMap<String, MetricValue>,
    pub uploaded_at: DateTime<Utc>,
    pub source_workbook: String,
    pub source_sheet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Normalize one raw cell into a metric value, or `None` to omit the field.
///
/// Numbers pass through. Strings are trimmed, thousands separators removed,
/// and parsed as numeric when what remains is digits with at most one
/// decimal point; anything else stays text. Empty and non-scalar cells are
/// dropped rather than stored.
pub fn normalize_cell(value: &JsonValue) -> Option<MetricValue> {
    match value {
        JsonValue::Number(n) => {
            if let Some(v) = n.as_i64() {
                Some(MetricValue::Integer(v))
            } else {
                n.as_f64().map(MetricValue::Float)
            }
        }
        JsonValue::String(s) => normalize_text(s),
        _ => None,
    }
}

fn normalize_text(raw: &str) -> Option<MetricValue> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let cleaned: String = trimmed.chars().filter(|c| *c != ',').collect();
    if is_numeric_literal(&cleaned) {
        if cleaned.contains('.') {
            if let Ok(v) = cleaned.parse::<f64>() {
                return Some(MetricValue::Float(v));
            }
        } else if let Ok(v) = cleaned.parse::<i64>() {
            return Some(MetricValue::Integer(v));
        }
    }
    Some(MetricValue::Text(trimmed.to_string()))
}

fn is_numeric_literal(text: &str) -> bool {
    let mut digits = 0usize;
    let mut dots = 0usize;
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits += 1;
        } else if c == '.' {
            dots += 1;
        } else {
            return false;
        }
    }
    digits > 0 && dots <= 1
}

/// Extract a raw identity field from a cell. Sheet exports frequently type
/// identifier columns as numbers, so numbers stringify; blank strings and
/// non-scalar cells are invalid.
pub fn identity_cell(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn new_profile_seeds_known_sets_and_event() {
        let profile = EntityProfile::new("1001", "Alice", "E1", now());
        assert_eq!(profile.primary_name, "Alice");
        assert_eq!(profile.known_ids, vec!["1001"]);
        assert_eq!(profile.known_names, vec!["Alice"]);
        assert_eq!(profile.active_events, vec!["E1"]);
        assert_eq!(profile.first_seen_event, "E1");
        assert_eq!(profile.last_seen_event, "E1");
    }

    #[test]
    fn observe_is_idempotent_and_append_only() {
        let mut profile = EntityProfile::new("1001", "Alice", "E1", now());
        profile.observe("1001", "Alice", "E1", now());
        assert_eq!(profile.known_ids, vec!["1001"]);
        assert_eq!(profile.known_names, vec!["Alice"]);
        assert_eq!(profile.active_events, vec!["E1"]);

        profile.observe("1002", "Alicia", "E2", now());
        assert_eq!(profile.known_ids, vec!["1001", "1002"]);
        assert_eq!(profile.known_names, vec!["Alice", "Alicia"]);
        assert_eq!(profile.active_events, vec!["E1", "E2"]);
        assert_eq!(profile.current_id, "1002");
        assert_eq!(profile.current_name, "Alicia");
        assert_eq!(profile.primary_name, "Alice");
        assert_eq!(profile.last_seen_event, "E2");
    }

    #[test]
    fn registry_serialization_preserves_profile_order() {
        let mut registry = Registry::default();
        registry.insert(EntityProfile::new("1", "first", "E1", now()));
        registry.insert(EntityProfile::new("2", "second", "E1", now()));
        registry.insert(EntityProfile::new("3", "third", "E1", now()));

        let text = serde_json::to_string(&registry).unwrap();
        let restored: Registry = serde_json::from_str(&text).unwrap();
        let names: Vec<_> = restored.profiles().map(|p| p.primary_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn normalize_cell_parses_numeric_text() {
        assert_eq!(
            normalize_cell(&json!("1,234,567")),
            Some(MetricValue::Integer(1_234_567))
        );
        assert_eq!(normalize_cell(&json!("42")), Some(MetricValue::Integer(42)));
        assert_eq!(normalize_cell(&json!("12.5")), Some(MetricValue::Float(12.5)));
        assert_eq!(
            normalize_cell(&json!("1,234.5")),
            Some(MetricValue::Float(1234.5))
        );
    }

    #[test]
    fn normalize_cell_keeps_non_numeric_text() {
        assert_eq!(
            normalize_cell(&json!("The Fold")),
            Some(MetricValue::Text("The Fold".to_string()))
        );
        assert_eq!(
            normalize_cell(&json!("12.5.6")),
            Some(MetricValue::Text("12.5.6".to_string()))
        );
        // A lone dot has no digits; it is not a number.
        assert_eq!(
            normalize_cell(&json!(".")),
            Some(MetricValue::Text(".".to_string()))
        );
        // Signs are not part of the numeric grammar the sources use.
        assert_eq!(
            normalize_cell(&json!("-5")),
            Some(MetricValue::Text("-5".to_string()))
        );
    }

    #[test]
    fn normalize_cell_drops_empty_and_non_scalar() {
        assert_eq!(normalize_cell(&json!("")), None);
        assert_eq!(normalize_cell(&json!("   ")), None);
        assert_eq!(normalize_cell(&json!(null)), None);
        assert_eq!(normalize_cell(&json!([1, 2])), None);
    }

    #[test]
    fn normalize_cell_passes_numbers_through() {
        assert_eq!(normalize_cell(&json!(7)), Some(MetricValue::Integer(7)));
        assert_eq!(normalize_cell(&json!(7.25)), Some(MetricValue::Float(7.25)));
    }

    #[test]
    fn identity_cell_accepts_strings_and_numbers() {
        assert_eq!(identity_cell(Some(&json!("  1001  "))), Some("1001".to_string()));
        assert_eq!(identity_cell(Some(&json!(1001))), Some("1001".to_string()));
        assert_eq!(identity_cell(Some(&json!(""))), None);
        assert_eq!(identity_cell(Some(&json!("   "))), None);
        assert_eq!(identity_cell(Some(&json!(null))), None);
        assert_eq!(identity_cell(None), None);
    }
}
