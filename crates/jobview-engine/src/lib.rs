//! Deduplication, statistics, cleanup and filter/sort view over job records.
//!
//! Every operation here pulls its own snapshot through a [`StoreConnector`];
//! nothing caches a record set between calls.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use jobview_core::{DuplicateGroup, JobRecord, JobStats, RecordId};
use jobview_storage::{
    validate_collection_name, ErrorKind, PgConnector, RecordStore, StoreConfig, StoreConnector,
    StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobview-engine";

pub const PAGE_SIZE: usize = 50;

pub const DEFAULT_BIND: &str = "0.0.0.0:5000";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub database_url: Option<String>,
    pub collection: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub bind: Option<String>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Built once at startup and passed to whatever needs the store.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub bind: String,
}

impl AppConfig {
    /// Layering: YAML file (if any), then environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("JOBVIEW_CONFIG").ok().map(PathBuf::from));
        let file = match path {
            Some(path) => Some(ConfigFile::read(&path)?),
            None => None,
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    pub fn from_sources(
        file: Option<ConfigFile>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = file.unwrap_or_default();
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let database_url = non_empty(env("DATABASE_URL"))
            .or_else(|| non_empty(file.database_url.clone()))
            .context("DATABASE_URL is required (environment or config file)")?;
        let collection =
            non_empty(env("JOBVIEW_COLLECTION")).or_else(|| non_empty(file.collection.clone()));
        if let Some(name) = &collection {
            validate_collection_name(name).context("validating configured collection")?;
        }
        let connect_timeout = match env("JOBVIEW_CONNECT_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse()
                    .with_context(|| format!("parsing JOBVIEW_CONNECT_TIMEOUT_SECS={raw}"))?,
            ),
            None => file
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(StoreConfig::DEFAULT_CONNECT_TIMEOUT),
        };
        let bind = non_empty(env("JOBVIEW_BIND"))
            .or_else(|| non_empty(file.bind.clone()))
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        Ok(Self {
            store: StoreConfig {
                collection,
                connect_timeout,
                ..StoreConfig::new(database_url)
            },
            bind,
        })
    }

    pub fn connector(&self) -> Result<Arc<dyn StoreConnector>> {
        let connector = PgConnector::new(self.store.clone()).context("building store connector")?;
        Ok(Arc::new(connector))
    }
}

/// Collapses a snapshot to one survivor per `job_id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupEngine;

impl DedupEngine {
    /// Keeps the first occurrence of each identifier in newest-first input,
    /// plus every record without an identifier. Input order is preserved.
    pub fn apply(&self, snapshot: &[JobRecord]) -> Vec<JobRecord> {
        let mut seen = HashSet::new();
        snapshot
            .iter()
            .filter(|record| match record.job_id.as_deref() {
                Some(job_id) => seen.insert(job_id),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Groups by identifier, in order of first appearance.
    pub fn duplicate_groups(&self, snapshot: &[JobRecord]) -> Vec<DuplicateGroup> {
        let mut index = HashMap::<&str, usize>::new();
        let mut groups = Vec::<DuplicateGroup>::new();
        for record in snapshot {
            let Some(job_id) = record.job_id.as_deref() else {
                continue;
            };
            let slot = *index.entry(job_id).or_insert_with(|| {
                groups.push(DuplicateGroup {
                    job_id: job_id.to_string(),
                    members: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].members.push(record.record_id);
        }
        groups
    }
}

/// Restores newest-first order if a store hands back anything else.
pub fn ensure_newest_first(snapshot: &mut [JobRecord]) {
    if snapshot
        .windows(2)
        .any(|pair| pair[0].record_id <= pair[1].record_id)
    {
        warn!(records = snapshot.len(), "snapshot not newest-first; reordering");
        snapshot.sort_by(|a, b| b.record_id.cmp(&a.record_id));
    }
}

pub fn aggregate_stats(snapshot: &[JobRecord], deduplicated: &[JobRecord]) -> JobStats {
    let mut with_id = 0usize;
    let mut distinct = HashSet::new();
    for job_id in snapshot.iter().filter_map(|r| r.job_id.as_deref()) {
        with_id += 1;
        distinct.insert(job_id);
    }

    let companies = deduplicated
        .iter()
        .map(|r| r.company_name.as_str())
        .filter(|c| !c.is_empty())
        .collect::<HashSet<_>>();

    JobStats {
        total_jobs: deduplicated.len(),
        total_documents: snapshot.len(),
        duplicate_count: with_id - distinct.len(),
        total_companies: companies.len(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupPlan {
    pub snapshot_size: usize,
    pub duplicate_groups: usize,
    /// Every non-survivor across all groups, ascending.
    pub candidates: Vec<RecordId>,
    /// Records without an identifier plus one per distinct identifier.
    pub kept_count: usize,
}

impl CleanupPlan {
    pub fn from_snapshot(snapshot: &[JobRecord]) -> Self {
        let groups = DedupEngine.duplicate_groups(snapshot);
        let without_id = snapshot.iter().filter(|r| r.job_id.is_none()).count();

        let mut candidates = groups
            .iter()
            .filter(|g| g.has_duplicates())
            .flat_map(DuplicateGroup::redundant)
            .collect::<Vec<_>>();
        candidates.sort_unstable();

        Self {
            snapshot_size: snapshot.len(),
            duplicate_groups: groups.iter().filter(|g| g.has_duplicates()).count(),
            candidates,
            kept_count: without_id + groups.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub run_id: Uuid,
    pub collection: String,
    pub requested_count: usize,
    pub deleted_count: u64,
    pub kept_count: usize,
}

impl CleanupReport {
    /// The store removed fewer records than were requested.
    pub fn is_partial(&self) -> bool {
        self.deleted_count < self.requested_count as u64
    }
}

/// Deletes every non-survivor in one batch.
///
/// Read-then-delete is not atomic: a duplicate ingested between the snapshot
/// and the delete survives this run and is removed by the next one.
#[derive(Clone)]
pub struct CleanupExecutor {
    connector: Arc<dyn StoreConnector>,
}

impl CleanupExecutor {
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Self { connector }
    }

    pub async fn run(&self) -> Result<CleanupReport, StoreError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("cleanup", %run_id);
        async move {
            let store = self.connector.open().await?;
            let outcome = execute_cleanup(store.as_ref(), run_id).await;
            store.close().await;
            outcome
        }
        .instrument(span)
        .await
    }
}

async fn execute_cleanup(store: &dyn RecordStore, run_id: Uuid) -> Result<CleanupReport, StoreError> {
    let snapshot = store.snapshot().await?;
    let plan = CleanupPlan::from_snapshot(&snapshot);
    info!(
        collection = store.collection(),
        records = plan.snapshot_size,
        duplicate_groups = plan.duplicate_groups,
        candidates = plan.candidates.len(),
        "cleanup plan computed"
    );

    let deleted_count = if plan.candidates.is_empty() {
        0
    } else {
        store.delete_many(&plan.candidates).await?
    };

    let report = CleanupReport {
        run_id,
        collection: store.collection().to_string(),
        requested_count: plan.candidates.len(),
        deleted_count,
        kept_count: plan.kept_count,
    };
    if report.is_partial() {
        warn!(
            requested = report.requested_count,
            deleted = report.deleted_count,
            "store deleted fewer duplicates than requested"
        );
    }
    info!(deleted = report.deleted_count, kept = report.kept_count, "cleanup finished");
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateFilter {
    #[default]
    Any,
    Today,
    /// Last 7 days, counted from today's midnight.
    ThisWeek,
    /// Last 30 days, counted from today's midnight.
    ThisMonth,
    Custom(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InvalidQuery(pub String);

impl DateFilter {
    /// `custom` without a date selects nothing, i.e. [`DateFilter::Any`].
    pub fn parse(kind: Option<&str>, custom_date: Option<&str>) -> Result<Self, InvalidQuery> {
        let custom_date = custom_date.map(str::trim).filter(|d| !d.is_empty());
        match kind.map(str::trim).unwrap_or_default() {
            "" | "none" | "all" | "any" => Ok(Self::Any),
            "today" => Ok(Self::Today),
            "week" | "this_week" | "thisWeek" => Ok(Self::ThisWeek),
            "month" | "this_month" | "thisMonth" => Ok(Self::ThisMonth),
            "custom" => match custom_date {
                None => Ok(Self::Any),
                Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map(Self::Custom)
                    .map_err(|_| InvalidQuery(format!("invalid custom date {raw:?}, expected YYYY-MM-DD"))),
            },
            other => Err(InvalidQuery(format!("unknown date filter {other:?}"))),
        }
    }

    pub fn matches(&self, posted_at: Option<NaiveDateTime>, today: NaiveDate) -> bool {
        if *self == Self::Any {
            return true;
        }
        let Some(posted_at) = posted_at else {
            return false;
        };
        let days_back = |days: i64| (today - chrono::Duration::days(days)).and_time(NaiveTime::MIN);
        match self {
            Self::Any => true,
            Self::Today => posted_at.date() == today,
            Self::ThisWeek => posted_at >= days_back(7),
            Self::ThisMonth => posted_at >= days_back(30),
            Self::Custom(date) => posted_at.date() == *date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    /// Case-insensitive substring over title, company and location.
    pub search: String,
    pub role: Option<String>,
    pub company: Option<String>,
    pub date: DateFilter,
    /// 1-based; clamped into range.
    pub page: usize,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            search: String::new(),
            role: None,
            company: None,
            date: DateFilter::Any,
            page: 1,
        }
    }
}

impl JobQuery {
    fn matches(&self, record: &JobRecord, needle: &str, posted_at: Option<NaiveDateTime>, today: NaiveDate) -> bool {
        let matches_search = needle.is_empty()
            || [&record.title, &record.company_name, &record.location]
                .iter()
                .any(|field| field.to_lowercase().contains(needle));
        let matches_role = self
            .role
            .as_deref()
            .map_or(true, |role| role.is_empty() || record.title == role);
        let matches_company = self
            .company
            .as_deref()
            .map_or(true, |company| company.is_empty() || record.company_name == company);

        matches_search && matches_role && matches_company && self.date.matches(posted_at, today)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetCount {
    pub value: String,
    pub count: usize,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobRecord>,
    pub page: usize,
    pub total_pages: usize,
    pub total_count: usize,
    pub page_size: usize,
    pub roles: Vec<FacetCount>,
    pub companies: Vec<FacetCount>,
}

/// Filter, sort (newest posted first, then newest record) and paginate an
/// already-deduplicated set.
pub fn view_jobs(deduplicated: &[JobRecord], query: &JobQuery, today: NaiveDate) -> JobPage {
    let needle = query.search.to_lowercase();
    let mut matched = deduplicated
        .iter()
        .filter_map(|record| {
            let posted_at = record.posted_at();
            query
                .matches(record, &needle, posted_at, today)
                .then_some((posted_at, record))
        })
        .collect::<Vec<_>>();
    matched.sort_by(|(ta, a), (tb, b)| tb.cmp(ta).then_with(|| b.record_id.cmp(&a.record_id)));

    let total_count = matched.len();
    let total_pages = total_count.max(1).div_ceil(PAGE_SIZE);
    let page = query.page.clamp(1, total_pages);
    let jobs = matched
        .into_iter()
        .skip((page - 1) * PAGE_SIZE)
        .take(PAGE_SIZE)
        .map(|(_, record)| record.clone())
        .collect();

    JobPage {
        jobs,
        page,
        total_pages,
        total_count,
        page_size: PAGE_SIZE,
        roles: facet_counts(deduplicated.iter().map(|r| r.title.as_str()), query.role.as_deref()),
        companies: facet_counts(
            deduplicated.iter().map(|r| r.company_name.as_str()),
            query.company.as_deref(),
        ),
    }
}

fn facet_counts<'a>(values: impl Iterator<Item = &'a str>, selected: Option<&str>) -> Vec<FacetCount> {
    let mut counts = BTreeMap::<&str, usize>::new();
    for value in values.filter(|v| !v.is_empty()) {
        *counts.entry(value).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(value, count)| FacetCount {
            selected: selected == Some(value),
            value: value.to_string(),
            count,
        })
        .collect()
}

/// Structured response for the view layer. Failures carry `error` and never
/// a payload, so an empty success is always distinguishable from a failure.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
        }
    }

    pub fn failure(err: &StoreError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_kind: None,
        }
    }

    fn from_result(result: Result<T, StoreError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => {
                warn!(error = %err, kind = ?err.kind(), "operation failed");
                Self::failure(&err)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobsPayload {
    pub count: usize,
    pub jobs: Vec<JobRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsPayload {
    pub stats: JobStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupPayload {
    pub message: String,
    pub deleted_count: u64,
    pub kept_count: usize,
}

impl From<CleanupReport> for CleanupPayload {
    fn from(report: CleanupReport) -> Self {
        Self {
            message: format!("Successfully deleted {} duplicate jobs", report.deleted_count),
            deleted_count: report.deleted_count,
            kept_count: report.kept_count,
        }
    }
}

/// Entry point for the view layer. Each call is one bounded store round trip.
#[derive(Clone)]
pub struct JobService {
    connector: Arc<dyn StoreConnector>,
    dedup: DedupEngine,
    cleanup: CleanupExecutor,
}

impl JobService {
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            cleanup: CleanupExecutor::new(connector.clone()),
            dedup: DedupEngine,
            connector,
        }
    }

    pub async fn snapshot(&self) -> Result<Vec<JobRecord>, StoreError> {
        let store = self.connector.open().await?;
        let result = store.snapshot().await;
        store.close().await;
        let mut snapshot = result?;
        ensure_newest_first(&mut snapshot);
        Ok(snapshot)
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let snapshot = self.snapshot().await?;
        Ok(self.dedup.apply(&snapshot))
    }

    pub async fn stats(&self) -> Result<JobStats, StoreError> {
        let snapshot = self.snapshot().await?;
        let deduplicated = self.dedup.apply(&snapshot);
        Ok(aggregate_stats(&snapshot, &deduplicated))
    }

    pub async fn view(&self, query: &JobQuery, today: NaiveDate) -> Result<JobPage, StoreError> {
        let deduplicated = self.list_jobs().await?;
        Ok(view_jobs(&deduplicated, query, today))
    }

    pub async fn cleanup(&self) -> Result<CleanupReport, StoreError> {
        self.cleanup.run().await
    }

    pub async fn discover(&self) -> Result<Vec<String>, StoreError> {
        self.connector.discover().await
    }

    pub async fn list_jobs_response(&self) -> ApiResponse<JobsPayload> {
        ApiResponse::from_result(self.list_jobs().await.map(|jobs| JobsPayload {
            count: jobs.len(),
            jobs,
        }))
    }

    pub async fn stats_response(&self) -> ApiResponse<StatsPayload> {
        ApiResponse::from_result(self.stats().await.map(|stats| StatsPayload { stats }))
    }

    pub async fn view_response(&self, query: &JobQuery, today: NaiveDate) -> ApiResponse<JobPage> {
        ApiResponse::from_result(self.view(query, today).await)
    }

    pub async fn cleanup_response(&self) -> ApiResponse<CleanupPayload> {
        ApiResponse::from_result(self.cleanup().await.map(CleanupPayload::from))
    }
}
