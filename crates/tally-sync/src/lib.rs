//! Ingestion pipeline: identity resolution, snapshot batching, sheet-date
//! resolution, and the run orchestrator.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tally_adapters::{
    FixtureWorkbookProvider, WorkbookProvider, MEMBER_ID, MEMBER_NAME, METRIC_FIELDS,
};
use tally_core::{
    identity_cell, normalize_cell, EntityProfile, MetricValue, Registry, SnapshotKey,
    SnapshotRecord,
};
use tally_storage::{
    FsSnapshotStore, JsonRegistryStore, RegistryStore, SnapshotStore, SnapshotWrite,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tally-sync";

/// One below the platform hard limit of 500 operations per atomic commit.
pub const MAX_COMMIT_OPS: usize = 499;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub registry_path: PathBuf,
    pub snapshots_dir: PathBuf,
    pub workbooks_dir: PathBuf,
    pub events_file: PathBuf,
    /// Inline `{folder: event_id}` JSON, overriding the events file.
    pub event_folders_json: Option<String>,
    pub batch_limit: usize,
    pub scheduler_enabled: bool,
    pub ingest_cron_1: String,
    pub ingest_cron_2: String,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            registry_path: std::env::var("TALLY_REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/registry.json")),
            snapshots_dir: std::env::var("TALLY_SNAPSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/snapshots")),
            workbooks_dir: std::env::var("TALLY_WORKBOOKS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./workbooks")),
            events_file: std::env::var("TALLY_EVENTS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./events.yaml")),
            event_folders_json: std::env::var("TALLY_EVENT_FOLDERS_JSON").ok(),
            batch_limit: std::env::var("TALLY_BATCH_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(MAX_COMMIT_OPS),
            scheduler_enabled: std::env::var("TALLY_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron_1: std::env::var("TALLY_INGEST_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            ingest_cron_2: std::env::var("TALLY_INGEST_CRON_2")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
        }
    }

    /// The folder-to-event mappings driving a run. Inline JSON wins over the
    /// events file. An empty mapping set aborts the run: without it there is
    /// nothing to ingest and nowhere to attribute snapshots.
    pub async fn load_event_mappings(&self) -> Result<Vec<EventMapping>> {
        if let Some(text) = &self.event_folders_json {
            let map: BTreeMap<String, String> =
                serde_json::from_str(text).context("parsing TALLY_EVENT_FOLDERS_JSON")?;
            if map.is_empty() {
                bail!("TALLY_EVENT_FOLDERS_JSON contains no event mappings");
            }
            return Ok(map
                .into_iter()
                .map(|(folder, event_id)| EventMapping { folder, event_id })
                .collect());
        }

        let text = tokio::fs::read_to_string(&self.events_file)
            .await
            .with_context(|| format!("reading {}", self.events_file.display()))?;
        let file: EventsFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", self.events_file.display()))?;
        if file.events.is_empty() {
            bail!("{} lists no events", self.events_file.display());
        }
        Ok(file.events)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EventsFile {
    #[serde(default)]
    events: Vec<EventMapping>,
}

/// One source folder of workbooks, ingested under one event identifier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventMapping {
    pub folder: String,
    pub event_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub entity_id: Uuid,
    pub newly_created: bool,
    pub ambiguous_name: bool,
}

/// Map a raw (id, name) pair to a stable entity, creating or updating
/// profiles in place. Pure in-memory mutation; idempotent within a run.
pub fn resolve_identity(
    registry: &mut Registry,
    raw_id: &str,
    raw_name: &str,
    event_id: &str,
    now: DateTime<Utc>,
) -> ResolvedIdentity {
    let raw_id = raw_id.trim();
    let raw_name = raw_name.trim();

    // Id binding is authoritative: the first profile that knows this id
    // wins, scanning in profile-insertion order.
    let mut entity_id = registry
        .profiles()
        .find(|p| p.knows_id(raw_id))
        .map(|p| p.entity_id);
    let mut ambiguous_name = false;

    if entity_id.is_none() {
        let matches: Vec<Uuid> = registry
            .profiles()
            .filter(|p| p.knows_name(raw_name))
            .map(|p| p.entity_id)
            .collect();
        match matches.as_slice() {
            [single] => entity_id = Some(*single),
            [] => {}
            _ => {
                // Never merge on an ambiguous name; duplicate profiles beat
                // a wrong merge.
                warn!(
                    name = raw_name,
                    matches = matches.len(),
                    "display name maps to multiple profiles; creating a new one"
                );
                ambiguous_name = true;
            }
        }
    }

    let (entity_id, newly_created) = match entity_id {
        Some(id) => (id, false),
        None => {
            let profile = EntityProfile::new(raw_id, raw_name, event_id, now);
            let id = profile.entity_id;
            registry.insert(profile);
            info!(name = raw_name, member_id = raw_id, entity_id = %id, "created entity profile");
            (id, true)
        }
    };

    registry
        .get_mut(&entity_id)
        .expect("profile present after resolution")
        .observe(raw_id, raw_name, event_id, now);

    ResolvedIdentity {
        entity_id,
        newly_created,
        ambiguous_name,
    }
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m-%d-%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%d/%m/%Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%b %d, %Y",
    "%b %d %Y",
];

static DATE_FRAGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}[-/]\d{1,2}[-/]\d{1,2}|\d{1,2}[-/]\d{1,2}[-/]\d{4}|[A-Za-z]+\s+\d{1,2}(?:,?\s+\d{4})?")
        .expect("valid regex")
});

fn parse_date_exact(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

/// Pull the snapshot date out of a sheet title: whole-title parse first,
/// then a date-like fragment. `None` skips the whole sheet.
pub fn resolve_snapshot_date(title: &str) -> Option<NaiveDate> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(date) = parse_date_exact(trimmed) {
        return Some(date);
    }
    let fragment = DATE_FRAGMENT_RE.find(trimmed)?.as_str();
    if let Some(date) = parse_date_exact(fragment) {
        return Some(date);
    }
    // Month-name titles often omit the year; assume the current one, which
    // is how the sources label in-season sheets.
    let with_year = format!("{} {}", fragment, Utc::now().year());
    ["%B %d %Y", "%b %d %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&with_year, fmt).ok())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub batches_committed: usize,
    pub batches_failed: usize,
    pub snapshots_committed: usize,
    pub snapshots_discarded: usize,
}

/// Accumulates snapshot upserts into size-bounded atomic commits.
pub struct SnapshotBatcher<'a> {
    store: &'a dyn SnapshotStore,
    limit: usize,
    queue: Vec<SnapshotWrite>,
    stats: BatchStats,
}

impl<'a> SnapshotBatcher<'a> {
    pub fn new(store: &'a dyn SnapshotStore, limit: usize) -> Self {
        Self {
            store,
            limit: limit.clamp(1, MAX_COMMIT_OPS),
            queue: Vec::new(),
            stats: BatchStats::default(),
        }
    }

    /// Enqueue one upsert, committing the batch when it reaches the ceiling.
    pub async fn stage(&mut self, write: SnapshotWrite) {
        self.queue.push(write);
        if self.queue.len() >= self.limit {
            self.flush().await;
        }
    }

    /// Commit whatever is queued. A failed commit is logged, counted, and
    /// discarded; it never stops the run.
    pub async fn flush(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.queue);
        match self.store.commit(&batch).await {
            Ok(()) => {
                self.stats.batches_committed += 1;
                self.stats.snapshots_committed += batch.len();
                debug!(documents = batch.len(), "committed snapshot batch");
            }
            Err(err) => {
                self.stats.batches_failed += 1;
                self.stats.snapshots_discarded += batch.len();
                warn!(
                    error = %err,
                    documents = batch.len(),
                    "snapshot batch commit failed; batch discarded"
                );
            }
        }
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub registry_profiles: usize,
    pub registry_load_degraded: bool,
    pub registry_save_failed: bool,
    pub entities_created: usize,
    pub name_ambiguities: usize,
    pub events_processed: usize,
    pub folders_unavailable: usize,
    pub workbooks_processed: usize,
    pub workbooks_unavailable: usize,
    pub sheets_processed: usize,
    pub sheets_skipped_undated: usize,
    pub rows_skipped_invalid: usize,
    pub snapshots_staged: usize,
    pub snapshots_committed: usize,
    pub snapshots_discarded: usize,
    pub batches_committed: usize,
    pub batches_failed: usize,
}

impl IngestRunSummary {
    fn started(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            registry_profiles: 0,
            registry_load_degraded: false,
            registry_save_failed: false,
            entities_created: 0,
            name_ambiguities: 0,
            events_processed: 0,
            folders_unavailable: 0,
            workbooks_processed: 0,
            workbooks_unavailable: 0,
            sheets_processed: 0,
            sheets_skipped_undated: 0,
            rows_skipped_invalid: 0,
            snapshots_staged: 0,
            snapshots_committed: 0,
            snapshots_discarded: 0,
            batches_committed: 0,
            batches_failed: 0,
        }
    }

    fn absorb_batch_stats(&mut self, stats: BatchStats) {
        self.batches_committed += stats.batches_committed;
        self.batches_failed += stats.batches_failed;
        self.snapshots_committed += stats.snapshots_committed;
        self.snapshots_discarded += stats.snapshots_discarded;
    }
}

fn collect_metrics(row: &BTreeMap<String, JsonValue>) -> BTreeMap<String, MetricValue> {
    let mut metrics = BTreeMap::new();
    for field in METRIC_FIELDS {
        if let Some(value) = row.get(*field).and_then(normalize_cell) {
            metrics.insert((*field).to_string(), value);
        }
    }
    metrics
}

/// Drives one ingestion run: load the registry, resolve and stage every
/// row, flush per sheet, save the registry once. Strictly sequential; every
/// failure short of unusable configuration is contained, logged, and
/// counted.
pub struct IngestPipeline {
    config: IngestConfig,
    registry_store: Arc<dyn RegistryStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    workbooks: Arc<dyn WorkbookProvider>,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Self {
        let registry_store = Arc::new(JsonRegistryStore::new(config.registry_path.clone()));
        let snapshot_store = Arc::new(FsSnapshotStore::new(config.snapshots_dir.clone()));
        let workbooks = Arc::new(FixtureWorkbookProvider::new(config.workbooks_dir.clone()));
        Self {
            config,
            registry_store,
            snapshot_store,
            workbooks,
        }
    }

    pub fn with_stores(
        mut self,
        registry_store: Arc<dyn RegistryStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        workbooks: Arc<dyn WorkbookProvider>,
    ) -> Self {
        self.registry_store = registry_store;
        self.snapshot_store = snapshot_store;
        self.workbooks = workbooks;
        self
    }

    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut summary = IngestRunSummary::started(run_id, started_at);
        let mappings = self.config.load_event_mappings().await?;
        info!(%run_id, events = mappings.len(), "ingestion run starting");

        let mut registry = match self.registry_store.load().await {
            Ok(Some(registry)) => {
                info!(profiles = registry.len(), "loaded entity registry");
                registry
            }
            Ok(None) => {
                info!("no entity registry found; starting fresh");
                Registry::default()
            }
            Err(err) => {
                // Continuing with an empty registry severs every entity from
                // its history for this run; operators must see this.
                warn!(error = %err, "failed to load entity registry; continuing with an empty one");
                summary.registry_load_degraded = true;
                Registry::default()
            }
        };

        for mapping in &mappings {
            let refs = match self.workbooks.list_workbooks(&mapping.folder).await {
                Ok(refs) => refs,
                Err(err) => {
                    warn!(
                        folder = mapping.folder.as_str(),
                        event = mapping.event_id.as_str(),
                        error = %err,
                        "failed to list workbooks; skipping event folder"
                    );
                    summary.folders_unavailable += 1;
                    continue;
                }
            };
            summary.events_processed += 1;
            if refs.is_empty() {
                info!(
                    folder = mapping.folder.as_str(),
                    event = mapping.event_id.as_str(),
                    "no workbooks in folder"
                );
                continue;
            }

            for workbook_ref in &refs {
                let workbook = match self.workbooks.load_workbook(workbook_ref).await {
                    Ok(workbook) => workbook,
                    Err(err) => {
                        warn!(
                            workbook = workbook_ref.workbook_id.as_str(),
                            error = %err,
                            "failed to load workbook; skipping"
                        );
                        summary.workbooks_unavailable += 1;
                        continue;
                    }
                };
                summary.workbooks_processed += 1;

                for sheet in &workbook.sheets {
                    let Some(date_id) = resolve_snapshot_date(&sheet.title) else {
                        warn!(
                            sheet = sheet.title.as_str(),
                            workbook = workbook.name.as_str(),
                            "no calendar date in sheet title; skipping sheet"
                        );
                        summary.sheets_skipped_undated += 1;
                        continue;
                    };
                    summary.sheets_processed += 1;

                    let mut batcher =
                        SnapshotBatcher::new(self.snapshot_store.as_ref(), self.config.batch_limit);
                    for row in &sheet.rows {
                        let Some(member_id) = identity_cell(row.get(MEMBER_ID)) else {
                            debug!(sheet = sheet.title.as_str(), "row without a member id; skipping");
                            summary.rows_skipped_invalid += 1;
                            continue;
                        };
                        let Some(member_name) = identity_cell(row.get(MEMBER_NAME)) else {
                            debug!(sheet = sheet.title.as_str(), "row without a member name; skipping");
                            summary.rows_skipped_invalid += 1;
                            continue;
                        };

                        let resolved = resolve_identity(
                            &mut registry,
                            &member_id,
                            &member_name,
                            &mapping.event_id,
                            Utc::now(),
                        );
                        if resolved.newly_created {
                            summary.entities_created += 1;
                        }
                        if resolved.ambiguous_name {
                            summary.name_ambiguities += 1;
                        }

                        let record = SnapshotRecord {
                            event_id: mapping.event_id.clone(),
                            date_id,
                            member_id,
                            member_name,
                            metrics: collect_metrics(row),
                            uploaded_at: Utc::now(),
                            source_workbook: workbook.name.clone(),
                            source_sheet: sheet.title.clone(),
                        };
                        batcher
                            .stage(SnapshotWrite {
                                key: SnapshotKey {
                                    entity_id: resolved.entity_id,
                                    event_id: mapping.event_id.clone(),
                                    date_id,
                                },
                                record,
                            })
                            .await;
                        summary.snapshots_staged += 1;
                    }
                    batcher.flush().await;
                    summary.absorb_batch_stats(batcher.stats());
                }
            }
        }

        summary.registry_profiles = registry.len();
        match self.registry_store.save(&registry).await {
            Ok(()) => info!(profiles = registry.len(), "saved entity registry"),
            Err(err) => {
                warn!(error = %err, "failed to save entity registry; identity links from this run are lost");
                summary.registry_save_failed = true;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            snapshots = summary.snapshots_committed,
            entities_created = summary.entities_created,
            "ingestion run finished"
        );
        Ok(summary)
    }
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    let config = IngestConfig::from_env();
    IngestPipeline::new(config).run_once().await
}

/// Cron-driven ingestion. A `try_lock` guard skips a trigger while a
/// previous run is still in flight; at most one run executes at a time
/// inside this process.
pub async fn maybe_build_scheduler(config: &IngestConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let run_guard = Arc::new(tokio::sync::Mutex::new(()));
    for cron in [&config.ingest_cron_1, &config.ingest_cron_2] {
        let run_guard = run_guard.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let run_guard = run_guard.clone();
            Box::pin(async move {
                let Ok(_guard) = run_guard.try_lock() else {
                    warn!("previous ingestion run still in flight; skipping this trigger");
                    return;
                };
                match run_ingest_once_from_env().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        snapshots = summary.snapshots_committed,
                        batches_failed = summary.batches_failed,
                        "scheduled ingestion run finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled ingestion run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
