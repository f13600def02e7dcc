//! Ingestion pipeline orchestration: fetch, persist, evaluate completeness.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use lotar_adapters::{adapter_for, AdapterError, SourceAdapter, StoreWinnerBatch};
use lotar_core::{
    CompletenessReport, CompletenessState, GameType, PrizeRank, RetryReason,
};
use lotar_storage::{CorpusError, CorpusStore, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotar-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Catch up from the newest persisted draw to the newest published one.
    Latest,
    /// Backfill every published draw from 1.
    All,
    /// Ingest a fixed draw number span (inclusive).
    Range { start: u32, end: u32 },
    /// Re-fetch store winners for draws that are still numbers-only.
    UpdateStoresOnly,
}

impl IngestMode {
    pub fn describe(&self) -> String {
        match self {
            IngestMode::Latest => "latest".to_string(),
            IngestMode::All => "all".to_string(),
            IngestMode::Range { start, end } => format!("range {start}-{end}"),
            IngestMode::UpdateStoresOnly => "update-stores".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// How many times one run may re-request an all-empty store listing
    /// before leaving the draw numbers-only for a later scheduled run.
    pub store_attempt_cap: u32,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("LOTAR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            user_agent: std::env::var("LOTAR_USER_AGENT")
                .unwrap_or_else(|_| "lotar/0.1".to_string()),
            http_timeout_secs: std::env::var("LOTAR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            store_attempt_cap: std::env::var("LOTAR_STORE_ATTEMPT_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DrawFailure {
    pub draw_no: u32,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub game: GameType,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub draws_fetched: usize,
    pub draws_persisted: usize,
    pub draws_skipped: usize,
    pub store_rows_persisted: usize,
    pub failures: Vec<DrawFailure>,
    pub latest_report: Option<CompletenessReport>,
}

impl RunSummary {
    fn begin(game: GameType, mode: IngestMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            game,
            mode: mode.describe(),
            started_at: now,
            finished_at: now,
            draws_fetched: 0,
            draws_persisted: 0,
            draws_skipped: 0,
            store_rows_persisted: 0,
            failures: Vec::new(),
            latest_report: None,
        }
    }
}

/// Completeness verdict for the newest indexed draw. An empty corpus is
/// itself a retryable condition.
pub fn evaluate_latest(store: &CorpusStore) -> Result<CompletenessReport, CorpusError> {
    match store.latest_draw_no()? {
        Some(draw_no) => evaluate_draw(store, draw_no),
        None => Ok(CompletenessReport {
            draw_no: 0,
            state: CompletenessState::NumbersOnly,
            needs_retry: true,
            reason: Some(RetryReason::NoIndex),
        }),
    }
}

/// Per-draw completeness: `Complete` iff the top-tier store rows are
/// non-empty. Scheduling is the caller's concern; this only reports.
pub fn evaluate_draw(store: &CorpusStore, draw_no: u32) -> Result<CompletenessReport, CorpusError> {
    if store.load_draw(draw_no)?.is_none() {
        return Ok(CompletenessReport {
            draw_no,
            state: CompletenessState::NumbersOnly,
            needs_retry: true,
            reason: Some(RetryReason::NoDrawFile),
        });
    }

    let complete = store
        .load_store_winners(draw_no)?
        .map(|set| !set.top_tier_is_empty())
        .unwrap_or(false);

    if complete {
        Ok(CompletenessReport {
            draw_no,
            state: CompletenessState::Complete,
            needs_retry: false,
            reason: None,
        })
    } else {
        Ok(CompletenessReport {
            draw_no,
            state: CompletenessState::NumbersOnly,
            needs_retry: true,
            reason: Some(RetryReason::ZeroStores),
        })
    }
}

enum DrawStep {
    Ingested { store_rows: usize },
    StoresRefreshed { store_rows: usize },
    AlreadyComplete,
    NotYetPublished,
}

/// One game type's ingestion run. Per-draw failures are recorded and the
/// run continues; only setup and index errors abort.
pub struct IngestPipeline {
    game: GameType,
    store: CorpusStore,
    http: HttpFetcher,
    adapter: Box<dyn SourceAdapter>,
    store_attempt_cap: u32,
}

impl IngestPipeline {
    pub fn new(config: &SyncConfig, game: GameType) -> Result<Self> {
        let store = CorpusStore::open(&config.data_dir, game)?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self::from_parts(
            store,
            http,
            adapter_for(game),
            config.store_attempt_cap,
        ))
    }

    pub fn from_parts(
        store: CorpusStore,
        http: HttpFetcher,
        adapter: Box<dyn SourceAdapter>,
        store_attempt_cap: u32,
    ) -> Self {
        Self {
            game: store.game(),
            store,
            http,
            adapter,
            store_attempt_cap,
        }
    }

    pub fn corpus(&self) -> &CorpusStore {
        &self.store
    }

    pub async fn run(&self, mode: IngestMode) -> Result<RunSummary> {
        let mut summary = RunSummary::begin(self.game, mode);

        match mode {
            IngestMode::Latest => {
                let published = self.adapter.latest_draw_no(&self.http).await?;
                let start = match self.store.latest_draw_no()? {
                    Some(known) => known + 1,
                    None => published,
                };
                self.ingest_span(start, published, &mut summary).await;
                self.retry_incomplete_latest(&mut summary).await?;
            }
            IngestMode::All => {
                let published = self.adapter.latest_draw_no(&self.http).await?;
                self.ingest_span(1, published, &mut summary).await;
            }
            IngestMode::Range { start, end } => {
                self.ingest_span(start, end, &mut summary).await;
            }
            IngestMode::UpdateStoresOnly => {
                self.update_stores(&mut summary).await?;
            }
        }

        summary.latest_report = Some(evaluate_latest(&self.store)?);
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn ingest_span(&self, start: u32, end: u32, summary: &mut RunSummary) {
        for draw_no in start..=end {
            match self.ingest_one(draw_no).await {
                Ok(DrawStep::Ingested { store_rows }) => {
                    summary.draws_fetched += 1;
                    summary.draws_persisted += 1;
                    summary.store_rows_persisted += store_rows;
                }
                Ok(DrawStep::StoresRefreshed { store_rows }) => {
                    summary.draws_skipped += 1;
                    summary.store_rows_persisted += store_rows;
                }
                Ok(DrawStep::AlreadyComplete) => {
                    summary.draws_skipped += 1;
                }
                Ok(DrawStep::NotYetPublished) => {
                    info!(draw_no, "draw not yet published; stopping forward scan");
                    break;
                }
                Err(err) => {
                    warn!(draw_no, %err, "draw ingestion failed; continuing with next");
                    summary.failures.push(DrawFailure {
                        draw_no,
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    async fn ingest_one(&self, draw_no: u32) -> Result<DrawStep> {
        if self.store.load_draw(draw_no)?.is_some() {
            let complete = self
                .store
                .load_store_winners(draw_no)?
                .map(|set| !set.top_tier_is_empty())
                .unwrap_or(false);
            if complete {
                return Ok(DrawStep::AlreadyComplete);
            }
            let store_rows = self.refresh_stores(draw_no).await?;
            return Ok(DrawStep::StoresRefreshed { store_rows });
        }

        let draw = match self.adapter.fetch_draw(&self.http, draw_no).await {
            Ok(draw) => draw,
            Err(AdapterError::NotYetPublished { .. }) => return Ok(DrawStep::NotYetPublished),
            Err(err) => return Err(err.into()),
        };
        self.store.upsert_draw(&draw)?;

        // Store attribution lags number results; a failed or empty store
        // fetch leaves the draw numbers-only, never un-persists it.
        let store_rows = match self.refresh_stores(draw_no).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(draw_no, %err, "store winner fetch failed; draw stays numbers-only");
                0
            }
        };
        Ok(DrawStep::Ingested { store_rows })
    }

    /// Fetch store winners, retrying an all-empty listing up to the
    /// attempt cap. Empty after the cap is not an error.
    async fn refresh_stores(&self, draw_no: u32) -> Result<usize> {
        for _ in 0..self.store_attempt_cap.max(1) {
            let batch = self.adapter.fetch_store_winners(&self.http, draw_no).await?;
            if !batch.winners.is_empty() {
                return self.persist_store_batch(draw_no, &batch);
            }
        }
        warn!(draw_no, "store listing still empty after attempt cap");
        Ok(0)
    }

    fn persist_store_batch(&self, draw_no: u32, batch: &StoreWinnerBatch) -> Result<usize> {
        let mut rows = 0usize;
        for rank in [PrizeRank::First, PrizeRank::Second, PrizeRank::Bonus] {
            let set = batch.winners.for_rank(rank);
            if !set.is_empty() {
                self.store.upsert_store_winners(draw_no, rank, set)?;
                rows += set.len();
            }
        }
        for store in &batch.registry_updates {
            self.store.upsert_store(store)?;
        }
        Ok(rows)
    }

    async fn retry_incomplete_latest(&self, summary: &mut RunSummary) -> Result<()> {
        let report = evaluate_latest(&self.store)?;
        if report.reason == Some(RetryReason::ZeroStores) {
            // The draw is already persisted; a failed refresh is a per-draw
            // failure in the summary, never a failed run.
            match self.refresh_stores(report.draw_no).await {
                Ok(rows) => summary.store_rows_persisted += rows,
                Err(err) => {
                    warn!(
                        draw_no = report.draw_no,
                        %err,
                        "store refresh failed; leaving draw numbers-only"
                    );
                    summary.failures.push(DrawFailure {
                        draw_no: report.draw_no,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn update_stores(&self, summary: &mut RunSummary) -> Result<()> {
        let draw_nos: Vec<u32> = self
            .store
            .manifest()?
            .entries
            .iter()
            .map(|e| e.draw_no)
            .collect();

        for draw_no in draw_nos {
            let report = evaluate_draw(&self.store, draw_no)?;
            if report.reason != Some(RetryReason::ZeroStores) {
                summary.draws_skipped += 1;
                continue;
            }
            match self.refresh_stores(draw_no).await {
                Ok(rows) => summary.store_rows_persisted += rows,
                Err(err) => {
                    warn!(draw_no, %err, "store refresh failed; continuing with next");
                    summary.failures.push(DrawFailure {
                        draw_no,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use lotar_core::{Draw, DrawResult, StoreWinnerInfo};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct FakeSource {
        latest: u32,
        stores: Mutex<HashMap<u32, Vec<StoreWinnerInfo>>>,
        store_calls: AtomicUsize,
        store_fetch_fails: AtomicBool,
    }

    impl FakeSource {
        fn new(latest: u32) -> Arc<Self> {
            Arc::new(Self {
                latest,
                stores: Mutex::new(HashMap::new()),
                store_calls: AtomicUsize::new(0),
                store_fetch_fails: AtomicBool::new(false),
            })
        }

        fn publish_stores(&self, draw_no: u32) {
            self.stores.lock().unwrap().insert(
                draw_no,
                vec![StoreWinnerInfo::Registered {
                    store_id: format!("store-{draw_no}"),
                    purchase_type: "자동".into(),
                }],
            );
        }

        fn break_store_fetch(&self) {
            self.store_fetch_fails.store(true, Ordering::SeqCst);
        }
    }

    /// Trait impls on `Arc<FakeSource>` directly would be foreign-type
    /// impls; the newtype keeps the adapter local while tests keep a
    /// handle on the shared fake.
    struct SharedSource(Arc<FakeSource>);

    #[async_trait]
    impl SourceAdapter for SharedSource {
        fn game_type(&self) -> GameType {
            GameType::Lotto645
        }

        async fn latest_draw_no(&self, _http: &HttpFetcher) -> Result<u32, AdapterError> {
            Ok(self.0.latest)
        }

        async fn fetch_draw(&self, _http: &HttpFetcher, draw_no: u32) -> Result<Draw, AdapterError> {
            if draw_no > self.0.latest {
                return Err(AdapterError::NotYetPublished { draw_no });
            }
            Ok(Draw {
                draw_no,
                draw_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
                result: DrawResult::Lotto645 {
                    numbers: vec![1, 2, 3, 4, 5, 6],
                    bonus_number: 7,
                },
                prize_tiers: Vec::new(),
                total_sales_amount: None,
                first_prize_store_info: Vec::new(),
                updated_at: Utc::now(),
            })
        }

        async fn fetch_store_winners(
            &self,
            _http: &HttpFetcher,
            draw_no: u32,
        ) -> Result<StoreWinnerBatch, AdapterError> {
            self.0.store_calls.fetch_add(1, Ordering::SeqCst);
            if self.0.store_fetch_fails.load(Ordering::SeqCst) {
                return Err(AdapterError::Fetch(lotar_storage::FetchError::HttpStatus {
                    status: 503,
                    url: "https://dhlottery.co.kr/test".to_string(),
                }));
            }
            let mut batch = StoreWinnerBatch::default();
            batch.winners.first_prize_store_info = self
                .0
                .stores
                .lock()
                .unwrap()
                .get(&draw_no)
                .cloned()
                .unwrap_or_default();
            Ok(batch)
        }
    }

    fn pipeline(dir: &Path, source: Arc<FakeSource>, attempt_cap: u32) -> IngestPipeline {
        let store = CorpusStore::open(dir, GameType::Lotto645).unwrap();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        IngestPipeline::from_parts(store, http, Box::new(SharedSource(source)), attempt_cap)
    }

    #[tokio::test]
    async fn latest_mode_catches_up_from_known_draw() {
        let dir = tempdir().unwrap();
        let source = FakeSource::new(1163);
        for draw_no in 1161..=1163 {
            source.publish_stores(draw_no);
        }

        let p = pipeline(dir.path(), source.clone(), 1);
        let seeded = p.run(IngestMode::Range { start: 1161, end: 1161 }).await.unwrap();
        assert_eq!(seeded.draws_persisted, 1);

        let summary = p.run(IngestMode::Latest).await.unwrap();
        assert_eq!(summary.draws_persisted, 2);
        assert!(summary.failures.is_empty());
        assert_eq!(p.corpus().latest_draw_no().unwrap(), Some(1163));

        let report = summary.latest_report.unwrap();
        assert_eq!(report.state, CompletenessState::Complete);
        assert!(!report.needs_retry);
    }

    #[tokio::test]
    async fn numbers_then_stores_transition() {
        let dir = tempdir().unwrap();
        let source = FakeSource::new(1162);

        let p = pipeline(dir.path(), source.clone(), 1);
        let summary = p
            .run(IngestMode::Range { start: 1161, end: 1162 })
            .await
            .unwrap();
        assert_eq!(summary.draws_persisted, 2);

        let report = summary.latest_report.unwrap();
        assert_eq!(report.state, CompletenessState::NumbersOnly);
        assert!(report.needs_retry);
        assert_eq!(report.reason, Some(RetryReason::ZeroStores));

        let before = p.corpus().load_draw(1162).unwrap().unwrap();

        source.publish_stores(1161);
        source.publish_stores(1162);
        let summary = p.run(IngestMode::UpdateStoresOnly).await.unwrap();
        assert_eq!(summary.store_rows_persisted, 2);

        let report = summary.latest_report.unwrap();
        assert_eq!(report.state, CompletenessState::Complete);

        // The transition never alters the number results.
        let after = p.corpus().load_draw(1162).unwrap().unwrap();
        assert_eq!(after.result, before.result);
        assert_eq!(after.prize_tiers, before.prize_tiers);
        assert_eq!(after.first_prize_store_info.len(), 1);
    }

    #[tokio::test]
    async fn range_scan_stops_at_unpublished_draw() {
        let dir = tempdir().unwrap();
        let source = FakeSource::new(1163);
        for draw_no in 1161..=1163 {
            source.publish_stores(draw_no);
        }

        let p = pipeline(dir.path(), source, 1);
        let summary = p
            .run(IngestMode::Range { start: 1161, end: 1200 })
            .await
            .unwrap();
        assert_eq!(summary.draws_persisted, 3);
        assert!(summary.failures.is_empty());
    }

    #[tokio::test]
    async fn empty_corpus_reports_no_index() {
        let dir = tempdir().unwrap();
        let store = CorpusStore::open(dir.path(), GameType::Lotto645).unwrap();

        let report = evaluate_latest(&store).unwrap();
        assert_eq!(report.state, CompletenessState::NumbersOnly);
        assert!(report.needs_retry);
        assert_eq!(report.reason, Some(RetryReason::NoIndex));
    }

    #[tokio::test]
    async fn attempt_cap_bounds_store_refetch() {
        let dir = tempdir().unwrap();
        let source = FakeSource::new(1161);

        let seed = pipeline(dir.path(), source.clone(), 1);
        seed.run(IngestMode::Range { start: 1161, end: 1161 }).await.unwrap();
        source.store_calls.store(0, Ordering::SeqCst);

        let p = pipeline(dir.path(), source.clone(), 3);
        let summary = p.run(IngestMode::UpdateStoresOnly).await.unwrap();
        assert_eq!(source.store_calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.store_rows_persisted, 0);
        assert_eq!(
            summary.latest_report.unwrap().reason,
            Some(RetryReason::ZeroStores)
        );
    }

    #[tokio::test]
    async fn store_fetch_failure_is_a_summary_entry_not_a_failed_run() {
        let dir = tempdir().unwrap();
        let source = FakeSource::new(1161);
        source.break_store_fetch();

        let p = pipeline(dir.path(), source.clone(), 1);
        let summary = p.run(IngestMode::Latest).await.unwrap();

        // The numbers are persisted even though every store fetch errored.
        assert!(p.corpus().load_draw(1161).unwrap().is_some());
        assert_eq!(summary.draws_persisted, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].draw_no, 1161);

        let report = summary.latest_report.unwrap();
        assert_eq!(report.state, CompletenessState::NumbersOnly);
        assert_eq!(report.reason, Some(RetryReason::ZeroStores));
    }
}
