//! On-disk draw corpus (index store) + HTTP fetch utilities.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use lotar_core::{
    Draw, GameType, IndexEntry, IndexManifest, PrizeRank, Store, StoreWinnerSet,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn};

pub const CRATE_NAME: &str = "lotar-storage";

// ---------------------------------------------------------------------------
// HTTP fetch layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Decoded response body. `body` is charset-decoded text (the source
/// serves EUC-KR pages; reqwest's `charset` feature handles them).
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

/// Shared HTTP client: one concurrency bound for the whole run, bounded
/// exponential backoff on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Semaphore,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self {
            client,
            limit: Semaphore::new(config.concurrency.max(1)),
            backoff: config.backoff,
        })
    }

    /// GET `url` with the given query parameters, retrying transient
    /// failures per the backoff policy before giving up.
    pub async fn fetch_text(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).query(query).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Corpus store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("index references unreadable draw file {file_ref} (draw {draw_no})")]
    IndexCorruption { draw_no: u32, file_ref: String },
}

/// Compact per-store row for `stores/index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreIndexRow {
    pub id: String,
    pub name: String,
    pub province: String,
    pub city: String,
    pub address: String,
    pub types: Vec<String>,
    #[serde(rename = "1st")]
    pub first: usize,
    #[serde(rename = "2nd")]
    pub second: usize,
}

/// One game type's on-disk corpus: per-draw record files, the store
/// registry, and the manifest. Single writer per run; every mutation
/// finishes with a full manifest rebuild so partial prior writes are
/// self-healing.
#[derive(Debug, Clone)]
pub struct CorpusStore {
    game: GameType,
    root: PathBuf,
}

impl CorpusStore {
    pub fn open(data_root: impl AsRef<Path>, game: GameType) -> Result<Self, CorpusError> {
        let root = data_root.as_ref().join(game.corpus_dir());
        let store = Self { game, root };
        create_dir_all(&store.draws_dir())?;
        create_dir_all(&store.stores_dir())?;
        Ok(store)
    }

    pub fn game(&self) -> GameType {
        self.game
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn draws_dir(&self) -> PathBuf {
        self.root.join("draws")
    }

    pub fn stores_dir(&self) -> PathBuf {
        self.root.join("stores")
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn draw_path(&self, draw_no: u32) -> PathBuf {
        self.draws_dir().join(self.game.draw_file_name(draw_no))
    }

    fn store_winners_path(&self, draw_no: u32) -> PathBuf {
        self.stores_dir().join(format!("stores_{draw_no}.json"))
    }

    fn registry_path(&self) -> PathBuf {
        self.root
            .join(format!("{}_stores.json", self.game.draw_file_prefix()))
    }

    /// Upsert a draw record. Fields present in `draw` win; store winner
    /// rows already collected for this draw are preserved when the new
    /// record carries none (number-only re-ingestion must never erase
    /// store data).
    pub fn upsert_draw(&self, draw: &Draw) -> Result<(), CorpusError> {
        let path = self.draw_path(draw.draw_no);
        let mut merged = draw.clone();

        if let Some(existing) = read_json_opt::<Draw>(&path)? {
            if merged.first_prize_store_info.is_empty() {
                merged.first_prize_store_info = existing.first_prize_store_info;
            }
            if merged.total_sales_amount.is_none() {
                merged.total_sales_amount = existing.total_sales_amount;
            }
            if merged.prize_tiers.is_empty() {
                merged.prize_tiers = existing.prize_tiers;
            }
        }

        write_json_atomic(&path, &merged)?;
        self.rebuild_manifest()?;
        Ok(())
    }

    /// Upsert store winner rows for one draw and one prize rank. 6/45
    /// embeds top-tier rows in the draw record; pension keeps a separate
    /// per-draw listing file covering all three ranks. Empty input is a
    /// no-op (never erases rows collected earlier).
    pub fn upsert_store_winners(
        &self,
        draw_no: u32,
        rank: PrizeRank,
        rows: &[lotar_core::StoreWinnerInfo],
    ) -> Result<(), CorpusError> {
        if rows.is_empty() {
            return Ok(());
        }

        if self.game.embeds_store_winners() {
            if rank != PrizeRank::First {
                return Ok(());
            }
            let path = self.draw_path(draw_no);
            let Some(mut draw) = read_json_opt::<Draw>(&path)? else {
                warn!(draw_no, "store winners arrived before the draw record");
                return Ok(());
            };
            draw.first_prize_store_info = rows.to_vec();
            draw.updated_at = Utc::now();
            write_json_atomic(&path, &draw)?;
        } else {
            let path = self.store_winners_path(draw_no);
            let mut set = read_json_opt::<StoreWinnerSet>(&path)?.unwrap_or_default();
            *set.for_rank_mut(rank) = rows.to_vec();
            write_json_atomic(&path, &set)?;
        }

        self.rebuild_manifest()?;
        Ok(())
    }

    /// The store winner rows known for one draw, across all ranks.
    pub fn load_store_winners(&self, draw_no: u32) -> Result<Option<StoreWinnerSet>, CorpusError> {
        if self.game.embeds_store_winners() {
            let Some(draw) = self.load_draw(draw_no)? else {
                return Ok(None);
            };
            Ok(Some(StoreWinnerSet {
                first_prize_store_info: draw.first_prize_store_info,
                ..StoreWinnerSet::default()
            }))
        } else {
            read_json_opt(&self.store_winners_path(draw_no))
        }
    }

    /// Upsert a store registry entry: the per-store file, the aggregate
    /// registry keyed by id, and the compact store index.
    pub fn upsert_store(&self, store: &Store) -> Result<(), CorpusError> {
        let path = self.stores_dir().join(format!("{}.json", store.store_id));
        let merged = match read_json_opt::<Store>(&path)? {
            Some(mut existing) => {
                existing.merge_from(store);
                existing
            }
            None => store.clone(),
        };
        write_json_atomic(&path, &merged)?;

        let mut registry: BTreeMap<String, Store> =
            read_json_opt(&self.registry_path())?.unwrap_or_default();
        registry.insert(merged.store_id.clone(), merged);
        write_json_atomic(&self.registry_path(), &registry)?;

        let rows: Vec<StoreIndexRow> = registry
            .values()
            .map(|s| {
                let (province, city) = s.address_parts();
                StoreIndexRow {
                    id: s.store_id.clone(),
                    name: s.name.clone(),
                    province,
                    city,
                    address: s.address.clone(),
                    types: s.lottery_types.clone(),
                    first: s.first_prize_count,
                    second: s.second_prize_count,
                }
            })
            .collect();
        write_json_atomic(&self.stores_dir().join("index.json"), &rows)?;
        Ok(())
    }

    pub fn store_registry(&self) -> Result<BTreeMap<String, Store>, CorpusError> {
        Ok(read_json_opt(&self.registry_path())?.unwrap_or_default())
    }

    pub fn load_draw(&self, draw_no: u32) -> Result<Option<Draw>, CorpusError> {
        read_json_opt(&self.draw_path(draw_no))
    }

    pub fn manifest(&self) -> Result<IndexManifest, CorpusError> {
        match read_json_opt::<IndexManifest>(&self.index_path())? {
            Some(manifest) => Ok(manifest),
            None => self.rebuild_manifest(),
        }
    }

    pub fn latest_draw_no(&self) -> Result<Option<u32>, CorpusError> {
        Ok(self.manifest()?.latest_draw_no())
    }

    /// Rebuild the manifest from the persisted draw records: dedup by
    /// draw number (latest write wins), sort strictly descending, stamp
    /// the write time. Always a full rebuild, never an in-place patch.
    pub fn rebuild_manifest(&self) -> Result<IndexManifest, CorpusError> {
        let mut by_draw_no: BTreeMap<u32, (Draw, String)> = BTreeMap::new();
        let prefix = format!("{}_", self.game.draw_file_prefix());

        let dir = self.draws_dir();
        let entries = std::fs::read_dir(&dir).map_err(|source| CorpusError::Io {
            op: "reading",
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| CorpusError::Io {
                op: "reading",
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let draw: Draw = match read_json_opt(&entry.path())? {
                Some(draw) => draw,
                None => continue,
            };
            let file_ref = format!("draws/{name}");
            match by_draw_no.get(&draw.draw_no) {
                Some((kept, _)) if kept.updated_at >= draw.updated_at => {}
                _ => {
                    by_draw_no.insert(draw.draw_no, (draw, file_ref));
                }
            }
        }

        let entries = by_draw_no
            .into_values()
            .rev()
            .map(|(draw, file_ref)| {
                let (numbers, bonus_number) = match &draw.result {
                    lotar_core::DrawResult::Lotto645 {
                        numbers,
                        bonus_number,
                    } => (Some(numbers.clone()), Some(*bonus_number)),
                    lotar_core::DrawResult::Pension720 { .. } => (None, None),
                };
                IndexEntry {
                    draw_no: draw.draw_no,
                    draw_date: draw.draw_date,
                    file_ref,
                    numbers,
                    bonus_number,
                }
            })
            .collect();

        let manifest = IndexManifest {
            entries,
            last_updated: Utc::now(),
        };
        write_json_atomic(&self.index_path(), &manifest)?;
        Ok(manifest)
    }

    /// Lazy, restartable cursor over all draws in manifest order
    /// (descending draw number). A manifest entry pointing at a missing
    /// file is index corruption: the manifest is rebuilt from the
    /// persisted records before iteration starts.
    pub fn all_draws(&self) -> Result<DrawCursor, CorpusError> {
        let mut manifest = self.manifest()?;
        let corrupt = manifest
            .entries
            .iter()
            .find(|e| !self.root.join(&e.file_ref).exists());
        if let Some(entry) = corrupt {
            warn!(
                draw_no = entry.draw_no,
                file_ref = %entry.file_ref,
                "manifest references a missing draw file; rebuilding"
            );
            manifest = self.rebuild_manifest()?;
        }
        Ok(DrawCursor {
            root: self.root.clone(),
            entries: manifest.entries,
            pos: 0,
        })
    }
}

/// Iterator over draw records in manifest order.
#[derive(Debug, Clone)]
pub struct DrawCursor {
    root: PathBuf,
    entries: Vec<IndexEntry>,
    pos: usize,
}

impl DrawCursor {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Iterator for DrawCursor {
    type Item = Result<Draw, CorpusError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.pos)?;
        self.pos += 1;
        let path = self.root.join(&entry.file_ref);
        match read_json_opt::<Draw>(&path) {
            Ok(Some(draw)) => Some(Ok(draw)),
            Ok(None) => Some(Err(CorpusError::IndexCorruption {
                draw_no: entry.draw_no,
                file_ref: entry.file_ref.clone(),
            })),
            Err(err) => Some(Err(err)),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON file helpers
// ---------------------------------------------------------------------------

fn create_dir_all(path: &Path) -> Result<(), CorpusError> {
    std::fs::create_dir_all(path).map_err(|source| CorpusError::Io {
        op: "creating",
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CorpusError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CorpusError::Io {
                op: "reading",
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let value = serde_json::from_str(&text).map_err(|source| CorpusError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

/// Write pretty JSON via a temp file + rename so readers never observe a
/// half-written record.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CorpusError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| CorpusError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let parent = path.parent().expect("corpus paths always have a parent");
    let temp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    std::fs::write(&temp_path, &bytes).map_err(|source| CorpusError::Io {
        op: "writing",
        path: temp_path.clone(),
        source,
    })?;
    std::fs::rename(&temp_path, path).map_err(|source| CorpusError::Io {
        op: "renaming",
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
