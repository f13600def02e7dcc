//! Source adapters for the dhlottery.co.kr publication surfaces.
//!
//! The 6/45 results live behind JSON endpoints; pension 720+ results are
//! served as EUC-KR HTML pages. Each adapter fetches raw payloads through
//! the shared [`HttpFetcher`], parses them into raw intermediate structs,
//! and hands those to [`normalize`] for the canonical records.

use async_trait::async_trait;
use lotar_core::{Draw, GameType, Store, StoreWinnerSet};
use lotar_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub mod normalize;

pub const CRATE_NAME: &str = "lotar-adapters";

pub const BASE_URL: &str = "https://dhlottery.co.kr";
pub const LOTTO_DRAW_URL: &str = "https://dhlottery.co.kr/lt645/selectPstLt645Info.do";
pub const LOTTO_STORE_URL: &str = "https://dhlottery.co.kr/wnprchsplcsrch/selectLtWnShp.do";
pub const PENSION_RESULT_URL: &str = "https://dhlottery.co.kr/gameResult.do";
pub const PENSION_STORE_URL: &str = "https://dhlottery.co.kr/store.do";

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The source has no data for this draw yet. A boundary condition for
    /// forward scans, not a failure.
    #[error("draw {draw_no} is not yet published")]
    NotYetPublished { draw_no: u32 },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The payload does not have the expected shape. Carries the offending
    /// fragment so the log line is actionable.
    #[error("malformed {context}: {fragment}")]
    MalformedRecord { context: String, fragment: String },
}

pub(crate) fn malformed(context: impl Into<String>, fragment: impl Into<String>) -> AdapterError {
    AdapterError::MalformedRecord {
        context: context.into(),
        fragment: fragment.into(),
    }
}

/// Store winner rows for one draw, plus the registry entries the same
/// payload yields (6/45 publishes full store records alongside the refs).
#[derive(Debug, Clone, Default)]
pub struct StoreWinnerBatch {
    pub winners: StoreWinnerSet,
    pub registry_updates: Vec<Store>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn game_type(&self) -> GameType;

    /// Newest draw number the source has published.
    async fn latest_draw_no(&self, http: &HttpFetcher) -> Result<u32, AdapterError>;

    /// Canonical draw record for `draw_no`, or `NotYetPublished`.
    async fn fetch_draw(&self, http: &HttpFetcher, draw_no: u32) -> Result<Draw, AdapterError>;

    /// Store winner rows for `draw_no`. An empty batch is a successful
    /// result: store attribution lags number results.
    async fn fetch_store_winners(
        &self,
        http: &HttpFetcher,
        draw_no: u32,
    ) -> Result<StoreWinnerBatch, AdapterError>;
}

pub fn adapter_for(game: GameType) -> Box<dyn SourceAdapter> {
    match game {
        GameType::Lotto645 => Box::new(Lotto645Adapter),
        GameType::Pension720 => Box::new(Pension720Adapter),
    }
}

// ---------------------------------------------------------------------------
// Lotto 6/45 (JSON endpoints)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct Lotto645Adapter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLottoPrizeTier {
    pub rank: String,
    pub winner_count: String,
    pub total_prize: String,
    pub prize_per_winner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLottoDraw {
    pub draw_no: u32,
    pub draw_date_ymd: String,
    pub numbers: Vec<i64>,
    pub bonus_number: i64,
    pub prize_tiers: Vec<RawLottoPrizeTier>,
    pub total_sales_amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLottoStoreRow {
    pub store_id: String,
    pub name: String,
    pub address: String,
    pub phone: Option<String>,
    pub lottery_types: Vec<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub rank: String,
    pub purchase_type: String,
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_u32(value: &JsonValue, key: &str) -> Option<u32> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_i64(value: &JsonValue, key: &str) -> Option<i64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_f64(value: &JsonValue, key: &str) -> Option<f64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numeric-or-string field rendered as the digit string the source shows.
fn json_display(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) => Some(s.trim().to_string()),
        _ => None,
    }
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str()
}

/// Unwrap the `data.list` envelope every 6/45 endpoint uses.
fn lotto_result_list(body: &str) -> Result<Vec<JsonValue>, AdapterError> {
    let value: JsonValue = serde_json::from_str(body)
        .map_err(|e| malformed("draw payload JSON", e.to_string()))?;
    let list = json_path(&value, &["data", "list"])
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(list)
}

pub fn parse_lotto_draw(body: &str, draw_no: u32) -> Result<RawLottoDraw, AdapterError> {
    let list = lotto_result_list(body)?;
    let info = list
        .first()
        .ok_or(AdapterError::NotYetPublished { draw_no })?;

    let numbers = (1..=6)
        .map(|i| json_i64(info, &format!("tm{i}WnNo")))
        .collect::<Option<Vec<i64>>>()
        .ok_or_else(|| malformed("winning numbers", info.to_string()))?;
    let bonus_number =
        json_i64(info, "bnsWnNo").ok_or_else(|| malformed("bonus number", info.to_string()))?;
    let draw_date_ymd = json_display(info, "ltRflYmd")
        .ok_or_else(|| malformed("draw date", info.to_string()))?;

    let prize_tiers = (1..=5)
        .map(|rank| RawLottoPrizeTier {
            rank: format!("{rank}등"),
            winner_count: json_display(info, &format!("rnk{rank}WnNope")).unwrap_or_default(),
            total_prize: json_display(info, &format!("rnk{rank}SumWnAmt")).unwrap_or_default(),
            prize_per_winner: json_display(info, &format!("rnk{rank}WnAmt")).unwrap_or_default(),
        })
        .collect();

    Ok(RawLottoDraw {
        draw_no,
        draw_date_ymd,
        numbers,
        bonus_number,
        prize_tiers,
        total_sales_amount: json_display(info, "wholEpsdSumNtslAmt").unwrap_or_default(),
    })
}

pub fn parse_lotto_latest(body: &str) -> Result<u32, AdapterError> {
    let list = lotto_result_list(body)?;
    // The endpoint has returned the list in ascending order; take the max
    // rather than trusting element order.
    list.iter()
        .filter_map(|info| json_u32(info, "ltEpsd"))
        .max()
        .ok_or_else(|| malformed("latest draw list", body.chars().take(200).collect::<String>()))
}

/// Parse the full winner-store listing. A malformed row is skipped with a
/// warning; it never poisons the rest of the batch.
pub fn parse_lotto_store_rows(body: &str) -> Result<Vec<RawLottoStoreRow>, AdapterError> {
    let list = lotto_result_list(body)?;
    let mut rows = Vec::with_capacity(list.len());
    for entry in &list {
        match parse_lotto_store_row(entry) {
            Ok(row) => rows.push(row),
            Err(err) => warn!(%err, "skipping malformed store row"),
        }
    }
    Ok(rows)
}

fn parse_lotto_store_row(entry: &JsonValue) -> Result<RawLottoStoreRow, AdapterError> {
    let store_id = json_display(entry, "ltShpId")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("store id", entry.to_string()))?;
    let name = json_str(entry, "shpNm")
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| malformed("store name", entry.to_string()))?
        .to_string();
    let address = json_str(entry, "shpAddr").map(str::trim).unwrap_or_default().to_string();
    let rank = json_display(entry, "wnShpRnk")
        .ok_or_else(|| malformed("store winner rank", entry.to_string()))?;

    let mut lottery_types = Vec::new();
    if json_str(entry, "l645LtNtslYn") == Some("Y") {
        lottery_types.push("lotto645".to_string());
    }
    if json_str(entry, "pt720NtslYn") == Some("Y") {
        lottery_types.push("pension720".to_string());
    }
    // The three scratch-ticket flags collapse into one type.
    let sells_speetto = ["st5LtNtslYn", "st10LtNtslYn", "st20LtNtslYn"]
        .iter()
        .any(|flag| json_str(entry, flag) == Some("Y"));
    if sells_speetto {
        lottery_types.push("speetto".to_string());
    }

    Ok(RawLottoStoreRow {
        store_id,
        name,
        address,
        phone: json_str(entry, "shpTelno")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(ToString::to_string),
        lottery_types,
        latitude: json_f64(entry, "shpLat").unwrap_or(0.0),
        longitude: json_f64(entry, "shpLot").unwrap_or(0.0),
        rank,
        purchase_type: json_str(entry, "atmtPsvYnTxt").unwrap_or_default().to_string(),
    })
}

#[async_trait]
impl SourceAdapter for Lotto645Adapter {
    fn game_type(&self) -> GameType {
        GameType::Lotto645
    }

    async fn latest_draw_no(&self, http: &HttpFetcher) -> Result<u32, AdapterError> {
        // Without a draw parameter the endpoint answers with the latest.
        let resp = http.fetch_text(LOTTO_DRAW_URL, &[]).await?;
        parse_lotto_latest(&resp.body)
    }

    async fn fetch_draw(&self, http: &HttpFetcher, draw_no: u32) -> Result<Draw, AdapterError> {
        let resp = http
            .fetch_text(LOTTO_DRAW_URL, &[("srchLtEpsd", draw_no.to_string())])
            .await?;
        let raw = parse_lotto_draw(&resp.body, draw_no)?;
        normalize::lotto_draw(&raw)
    }

    async fn fetch_store_winners(
        &self,
        http: &HttpFetcher,
        draw_no: u32,
    ) -> Result<StoreWinnerBatch, AdapterError> {
        let resp = http
            .fetch_text(
                LOTTO_STORE_URL,
                &[
                    ("srchWnShpRnk", "all".to_string()),
                    ("srchLtEpsd", draw_no.to_string()),
                ],
            )
            .await?;
        let rows = parse_lotto_store_rows(&resp.body)?;
        Ok(normalize::lotto_store_batch(&rows, draw_no))
    }
}

// ---------------------------------------------------------------------------
// Pension 720+ (EUC-KR HTML pages)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct Pension720Adapter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPensionDraw {
    pub draw_no: u32,
    pub date_text: String,
    pub group: String,
    pub digits: Vec<String>,
    pub bonus_group: String,
    pub bonus_digits: Vec<String>,
    /// (rank label, winner count) rows; the winner count keeps the page's
    /// text with thousands separators removed.
    pub prize_rows: Vec<(String, String)>,
}

/// Inline (name, address) rows per prize rank, in page order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPensionStores {
    pub first: Vec<(String, String)>,
    pub second: Vec<(String, String)>,
    pub bonus: Vec<(String, String)>,
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| malformed("selector", e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(scope: ElementRef, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).next().and_then(element_text))
}

fn select_all_texts(scope: ElementRef, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).filter_map(element_text).collect())
}

pub fn parse_pension_latest(html: &str) -> Result<u32, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let current = select_first_text(root, "select#Round option[selected]")?;
    let first = select_first_text(root, "select#Round option")?;
    let text = current
        .or(first)
        .ok_or_else(|| malformed("round selector", "select#Round not found".to_string()))?;
    text.parse()
        .map_err(|_| malformed("round number", text))
}

pub fn parse_pension_draw(html: &str, draw_no: u32) -> Result<RawPensionDraw, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let block_sel = selector(".win720_num")?;
    let blocks: Vec<ElementRef> = root.select(&block_sel).collect();
    if blocks.len() < 2 {
        // No result blocks at all: the round page exists but carries no
        // numbers yet.
        return Err(AdapterError::NotYetPublished { draw_no });
    }

    let date_text = select_first_text(root, "p.desc")?
        .ok_or_else(|| malformed("draw date", "p.desc not found".to_string()))?;

    let group = select_first_text(blocks[0], ".group span.num")?
        .ok_or_else(|| malformed("winner group", "group digit not found".to_string()))?;
    let digits = last_six_digits(select_all_texts(blocks[0], "span.num.large")?, draw_no)?;

    let bonus_group = select_first_text(blocks[1], ".group span.num")?.unwrap_or_default();
    let bonus_digits = last_six_digits(select_all_texts(blocks[1], "span.num.large")?, draw_no)?;

    let mut prize_rows = Vec::new();
    let table_sel = selector("table.tbl_data.tbl_data_col")?;
    let row_sel = selector("tbody tr")?;
    let cell_sel = selector("td")?;
    if let Some(table) = root.select(&table_sel).next() {
        for row in table.select(&row_sel) {
            let cells: Vec<String> = row.select(&cell_sel).filter_map(element_text).collect();
            if cells.len() >= 2 {
                let rank = cells[0].clone();
                let winner_count = cells[cells.len() - 1].replace(',', "");
                prize_rows.push((rank, winner_count));
            }
        }
    }

    Ok(RawPensionDraw {
        draw_no,
        date_text,
        group,
        digits,
        bonus_group,
        bonus_digits,
        prize_rows,
    })
}

/// The number strip renders the group digit in the same span class as the
/// six winning digits; the winning digits are always the trailing six.
fn last_six_digits(texts: Vec<String>, draw_no: u32) -> Result<Vec<String>, AdapterError> {
    if texts.len() < 6 {
        return Err(malformed(
            format!("digit strip for draw {draw_no}"),
            format!("expected 6 digits, found {}", texts.len()),
        ));
    }
    Ok(texts[texts.len() - 6..].to_vec())
}

pub fn parse_pension_stores(html: &str) -> Result<RawPensionStores, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let table_sel = selector(".group_content table.tbl_data.tbl_data_col")?;
    let row_sel = selector("tbody tr")?;
    let cell_sel = selector("td")?;

    let mut stores = RawPensionStores::default();
    for (table_index, table) in root.select(&table_sel).enumerate() {
        let bucket = match table_index {
            0 => &mut stores.first,
            1 => &mut stores.second,
            2 => &mut stores.bonus,
            _ => break,
        };
        for row in table.select(&row_sel) {
            let cells: Vec<String> = row.select(&cell_sel).filter_map(element_text).collect();
            if cells.len() >= 3 {
                bucket.push((cells[1].clone(), cells[2].clone()));
            } else {
                warn!(?cells, "skipping malformed store row");
            }
        }
    }
    Ok(stores)
}

#[async_trait]
impl SourceAdapter for Pension720Adapter {
    fn game_type(&self) -> GameType {
        GameType::Pension720
    }

    async fn latest_draw_no(&self, http: &HttpFetcher) -> Result<u32, AdapterError> {
        let resp = http
            .fetch_text(PENSION_RESULT_URL, &[("method", "win720".to_string())])
            .await?;
        parse_pension_latest(&resp.body)
    }

    async fn fetch_draw(&self, http: &HttpFetcher, draw_no: u32) -> Result<Draw, AdapterError> {
        let resp = http
            .fetch_text(
                PENSION_RESULT_URL,
                &[
                    ("method", "win720".to_string()),
                    ("Round", draw_no.to_string()),
                ],
            )
            .await?;
        let raw = parse_pension_draw(&resp.body, draw_no)?;
        normalize::pension_draw(&raw)
    }

    async fn fetch_store_winners(
        &self,
        http: &HttpFetcher,
        draw_no: u32,
    ) -> Result<StoreWinnerBatch, AdapterError> {
        let resp = http
            .fetch_text(
                PENSION_STORE_URL,
                &[
                    ("method", "topStore".to_string()),
                    ("pageGubun", "L720".to_string()),
                    ("drwNo", draw_no.to_string()),
                ],
            )
            .await?;
        let raw = parse_pension_stores(&resp.body)?;
        Ok(normalize::pension_store_batch(&raw))
    }
}
