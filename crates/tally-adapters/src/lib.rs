//! Tabular source collaborator: the workbook/sheet model, the static
//! header-alias table, and a fixture-directory workbook provider.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "tally-adapters";

/// Canonical identity fields every source row must carry.
pub const MEMBER_ID: &str = "Member ID";
pub const MEMBER_NAME: &str = "Member Name";

/// Canonical metric fields the snapshot writer persists. Headers outside
/// this vocabulary survive canonicalization untouched and are ignored
/// downstream.
pub const METRIC_FIELDS: &[&str] = &[
    "Power",
    "Kill Points",
    "T4 Kills",
    "T5 Kills",
    "Deaths",
    "Alliance",
    "Helps",
    "Resources Gathered",
];

/// Header spellings seen in the wild, mapped to one canonical name per
/// concept. Lookup is exact on the trimmed header.
const HEADER_ALIASES: &[(&str, &str)] = &[
    ("Member ID", MEMBER_ID),
    ("Member Id", MEMBER_ID),
    ("member id", MEMBER_ID),
    ("member_id", MEMBER_ID),
    ("MemberID", MEMBER_ID),
    ("MemberId", MEMBER_ID),
    ("memberid", MEMBER_ID),
    ("Member Name", MEMBER_NAME),
    ("Member name", MEMBER_NAME),
    ("member name", MEMBER_NAME),
    ("member_name", MEMBER_NAME),
    ("MemberName", MEMBER_NAME),
    ("membername", MEMBER_NAME),
    ("Power", "Power"),
    ("power", "Power"),
    ("Kill Points", "Kill Points"),
    ("kill points", "Kill Points"),
    ("Kill points", "Kill Points"),
    ("KillPoints", "Kill Points"),
    ("killpoints", "Kill Points"),
    ("Total Kill Points", "Kill Points"),
    ("total kill points", "Kill Points"),
    ("Total KP", "Kill Points"),
    ("total kp", "Kill Points"),
    ("Total Kp", "Kill Points"),
    ("TotalKP", "Kill Points"),
    ("totalkp", "Kill Points"),
    ("KP Total", "Kill Points"),
    ("kp total", "Kill Points"),
    ("T4 Kills", "T4 Kills"),
    ("t4 kills", "T4 Kills"),
    ("T4Kills", "T4 Kills"),
    ("Tier 4 Kills", "T4 Kills"),
    ("tier 4 kills", "T4 Kills"),
    ("T5 Kills", "T5 Kills"),
    ("t5 kills", "T5 Kills"),
    ("T5Kills", "T5 Kills"),
    ("Tier 5 Kills", "T5 Kills"),
    ("tier 5 kills", "T5 Kills"),
    ("Deaths", "Deaths"),
    ("deaths", "Deaths"),
    ("Dead", "Deaths"),
    ("dead", "Deaths"),
    ("Deads", "Deaths"),
    ("deads", "Deaths"),
    ("Dead Troops", "Deaths"),
    ("dead troops", "Deaths"),
    ("DeadTroops", "Deaths"),
    ("Alliance", "Alliance"),
    ("alliance", "Alliance"),
    ("Alliance Tag", "Alliance"),
    ("alliance tag", "Alliance"),
    ("Helps", "Helps"),
    ("helps", "Helps"),
    ("Helps Given", "Helps"),
    ("helps given", "Helps"),
    ("HelpsGiven", "Helps"),
    ("helpsgiven", "Helps"),
    ("Resources Gathered", "Resources Gathered"),
    ("resources gathered", "Resources Gathered"),
    ("ResourcesGathered", "Resources Gathered"),
    ("resourcesGathered", "Resources Gathered"),
    ("RSS Gathered", "Resources Gathered"),
    ("rss gathered", "Resources Gathered"),
];

/// Resolve a raw header to its canonical field name, if it is a known alias.
pub fn canonical_header(raw: &str) -> Option<&'static str> {
    let trimmed = raw.trim();
    HEADER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == trimmed)
        .map(|(_, canonical)| *canonical)
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Discovery handle for one workbook inside a source folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkbookRef {
    pub workbook_id: String,
    pub name: String,
}

/// One loaded workbook: a named collection of dated sheets.
#[derive(Debug, Clone)]
pub struct WorkbookBundle {
    pub workbook_id: String,
    pub name: String,
    pub sheets: Vec<SheetTable>,
}

/// One sheet: a title (carrying the snapshot date) and rows keyed by
/// canonical field name.
#[derive(Debug, Clone)]
pub struct SheetTable {
    pub title: String,
    pub rows: Vec<BTreeMap<String, JsonValue>>,
}

#[async_trait]
pub trait WorkbookProvider: Send + Sync {
    /// Ordered list of workbooks under one source folder.
    async fn list_workbooks(&self, folder: &str) -> Result<Vec<WorkbookRef>, AdapterError>;

    async fn load_workbook(&self, workbook: &WorkbookRef) -> Result<WorkbookBundle, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct RawWorkbookFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sheets: Vec<RawSheet>,
}

#[derive(Debug, Deserialize)]
struct RawSheet {
    title: String,
    #[serde(default)]
    rows: Vec<BTreeMap<String, JsonValue>>,
}

fn canonicalize_row(row: BTreeMap<String, JsonValue>) -> BTreeMap<String, JsonValue> {
    row.into_iter()
        .map(|(header, value)| {
            let key = match canonical_header(&header) {
                Some(canonical) => canonical.to_string(),
                None => header.trim().to_string(),
            };
            (key, value)
        })
        .collect()
}

/// Workbook provider reading `<root>/<folder>/*.json` fixture files, sorted
/// by file name so discovery order is deterministic.
#[derive(Debug, Clone)]
pub struct FixtureWorkbookProvider {
    root: PathBuf,
}

impl FixtureWorkbookProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl WorkbookProvider for FixtureWorkbookProvider {
    async fn list_workbooks(&self, folder: &str) -> Result<Vec<WorkbookRef>, AdapterError> {
        let dir = self.root.join(folder);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing workbook folder {}", dir.display()))?;

        let mut refs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading workbook folder {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            refs.push(WorkbookRef {
                workbook_id: format!("{folder}/{stem}"),
                name: stem.to_string(),
            });
        }
        refs.sort_by(|a, b| a.workbook_id.cmp(&b.workbook_id));
        Ok(refs)
    }

    async fn load_workbook(&self, workbook: &WorkbookRef) -> Result<WorkbookBundle, AdapterError> {
        let path = self.root.join(format!("{}.json", workbook.workbook_id));
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading workbook {}", path.display()))?;
        let raw: RawWorkbookFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing workbook {}", path.display()))?;

        let sheets = raw
            .sheets
            .into_iter()
            .map(|sheet| SheetTable {
                title: sheet.title,
                rows: sheet.rows.into_iter().map(canonicalize_row).collect(),
            })
            .collect();

        Ok(WorkbookBundle {
            workbook_id: workbook.workbook_id.clone(),
            name: raw.name.unwrap_or_else(|| workbook.name.clone()),
            sheets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aliases_collapse_to_one_canonical_name() {
        assert_eq!(canonical_header("member_id"), Some(MEMBER_ID));
        assert_eq!(canonical_header("MemberID"), Some(MEMBER_ID));
        assert_eq!(canonical_header("  Member ID  "), Some(MEMBER_ID));
        assert_eq!(canonical_header("Total KP"), Some("Kill Points"));
        assert_eq!(canonical_header("total kill points"), Some("Kill Points"));
        assert_eq!(canonical_header("dead troops"), Some("Deaths"));
        assert_eq!(canonical_header("alliance tag"), Some("Alliance"));
        assert_eq!(canonical_header("Commander ID"), None);
    }

    #[test]
    fn every_alias_targets_a_known_canonical_field() {
        for (_, canonical) in HEADER_ALIASES {
            assert!(
                *canonical == MEMBER_ID
                    || *canonical == MEMBER_NAME
                    || METRIC_FIELDS.contains(canonical),
                "alias target {canonical} is not a canonical field"
            );
        }
    }

    #[test]
    fn canonicalize_row_renames_known_headers_and_keeps_the_rest() {
        let row: BTreeMap<String, JsonValue> = [
            ("member_id".to_string(), json!(1001)),
            ("Member Name".to_string(), json!("Alice")),
            ("total kp".to_string(), json!("1,234")),
            ("Mystery Column".to_string(), json!("x")),
        ]
        .into_iter()
        .collect();

        let canonical = canonicalize_row(row);
        assert_eq!(canonical.get(MEMBER_ID), Some(&json!(1001)));
        assert_eq!(canonical.get(MEMBER_NAME), Some(&json!("Alice")));
        assert_eq!(canonical.get("Kill Points"), Some(&json!("1,234")));
        assert_eq!(canonical.get("Mystery Column"), Some(&json!("x")));
    }

    #[tokio::test]
    async fn provider_lists_sorted_and_loads_canonicalized_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let folder = dir.path().join("spring");
        std::fs::create_dir_all(&folder).expect("mkdir");
        std::fs::write(
            folder.join("week-2.json"),
            serde_json::to_vec(&json!({
                "sheets": [{"title": "2025-03-11", "rows": [{"member id": 7, "Member Name": "Bryn"}]}]
            }))
            .expect("serialize"),
        )
        .expect("write");
        std::fs::write(
            folder.join("week-1.json"),
            serde_json::to_vec(&json!({
                "name": "Week One",
                "sheets": [{"title": "2025-03-04", "rows": [{"MemberID": 7, "membername": "Bryn", "power": "12,345"}]}]
            }))
            .expect("serialize"),
        )
        .expect("write");

        let provider = FixtureWorkbookProvider::new(dir.path());
        let refs = provider.list_workbooks("spring").await.expect("list");
        let ids: Vec<_> = refs.iter().map(|r| r.workbook_id.as_str()).collect();
        assert_eq!(ids, vec!["spring/week-1", "spring/week-2"]);

        let bundle = provider.load_workbook(&refs[0]).await.expect("load");
        assert_eq!(bundle.name, "Week One");
        assert_eq!(bundle.sheets.len(), 1);
        let row = &bundle.sheets[0].rows[0];
        assert_eq!(row.get(MEMBER_ID), Some(&json!(7)));
        assert_eq!(row.get(MEMBER_NAME), Some(&json!("Bryn")));
        assert_eq!(row.get("Power"), Some(&json!("12,345")));
    }

    #[tokio::test]
    async fn missing_folder_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = FixtureWorkbookProvider::new(dir.path());
        assert!(provider.list_workbooks("nowhere").await.is_err());
    }
}
