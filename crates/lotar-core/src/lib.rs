//! Core domain model for the lottery draw corpus.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lotar-core";

/// Supported game types. Each owns its own corpus directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameType {
    Lotto645,
    Pension720,
}

impl GameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameType::Lotto645 => "lotto645",
            GameType::Pension720 => "pension720",
        }
    }

    /// Corpus directory name under the data root.
    pub fn corpus_dir(&self) -> &'static str {
        match self {
            GameType::Lotto645 => "lotto",
            GameType::Pension720 => "pension",
        }
    }

    /// Prefix used for per-draw record files (`lotto_1161.json`).
    pub fn draw_file_prefix(&self) -> &'static str {
        self.corpus_dir()
    }

    pub fn draw_file_name(&self, draw_no: u32) -> String {
        format!("{}_{}.json", self.draw_file_prefix(), draw_no)
    }

    /// Whether top-tier store winners are embedded in the draw record
    /// (6/45) or published as a separate per-draw listing (pension).
    pub fn embeds_store_winners(&self) -> bool {
        matches!(self, GameType::Lotto645)
    }
}

impl std::str::FromStr for GameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lotto645" | "lotto" => Ok(GameType::Lotto645),
            "pension720" | "pension" => Ok(GameType::Pension720),
            other => Err(format!("unknown game type: {other}")),
        }
    }
}

/// Game-specific result payload, flattened into the draw record so the
/// persisted JSON keeps the source's field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DrawResult {
    Lotto645 {
        numbers: Vec<u8>,
        bonus_number: u8,
    },
    Pension720 {
        group: String,
        numbers: Vec<u8>,
        bonus_group: String,
        bonus_numbers: Vec<u8>,
    },
}

impl DrawResult {
    pub fn game_type(&self) -> GameType {
        match self {
            DrawResult::Lotto645 { .. } => GameType::Lotto645,
            DrawResult::Pension720 { .. } => GameType::Pension720,
        }
    }

    pub fn numbers(&self) -> &[u8] {
        match self {
            DrawResult::Lotto645 { numbers, .. } => numbers,
            DrawResult::Pension720 { numbers, .. } => numbers,
        }
    }

    /// Arity and value-range check. Both games draw exactly six main
    /// values; 6/45 adds one bonus number, pension adds six bonus digits.
    pub fn has_valid_arity(&self) -> bool {
        match self {
            DrawResult::Lotto645 {
                numbers,
                bonus_number,
            } => {
                numbers.len() == 6
                    && numbers.iter().all(|n| (1..=45).contains(n))
                    && (1..=45).contains(bonus_number)
            }
            DrawResult::Pension720 {
                numbers,
                bonus_numbers,
                ..
            } => {
                numbers.len() == 6
                    && bonus_numbers.len() == 6
                    && numbers.iter().chain(bonus_numbers).all(|d| *d <= 9)
            }
        }
    }
}

/// One prize tier row. Currency fields are preserved verbatim from the
/// source; parse at the consumption site if arithmetic is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeTier {
    pub rank: String,
    pub winner_count: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_prize: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prize_per_winner: Option<String>,
}

/// Winner attribution at store granularity. 6/45 references the shared
/// store registry by id; pension publishes inline name/address rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreWinnerInfo {
    Registered {
        store_id: String,
        #[serde(rename = "type", default)]
        purchase_type: String,
    },
    Inline {
        name: String,
        address: String,
    },
}

impl StoreWinnerInfo {
    pub fn store_id(&self) -> Option<&str> {
        match self {
            StoreWinnerInfo::Registered { store_id, .. } => Some(store_id),
            StoreWinnerInfo::Inline { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrizeRank {
    First,
    Second,
    Bonus,
}

impl PrizeRank {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrizeRank::First => "first",
            PrizeRank::Second => "second",
            PrizeRank::Bonus => "bonus",
        }
    }
}

/// Per-draw store winner listing (the `stores_<draw_no>.json` shape).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreWinnerSet {
    #[serde(default)]
    pub first_prize_store_info: Vec<StoreWinnerInfo>,
    #[serde(default)]
    pub second_prize_store_info: Vec<StoreWinnerInfo>,
    #[serde(default)]
    pub bonus_prize_store_info: Vec<StoreWinnerInfo>,
}

impl StoreWinnerSet {
    pub fn for_rank(&self, rank: PrizeRank) -> &[StoreWinnerInfo] {
        match rank {
            PrizeRank::First => &self.first_prize_store_info,
            PrizeRank::Second => &self.second_prize_store_info,
            PrizeRank::Bonus => &self.bonus_prize_store_info,
        }
    }

    pub fn for_rank_mut(&mut self, rank: PrizeRank) -> &mut Vec<StoreWinnerInfo> {
        match rank {
            PrizeRank::First => &mut self.first_prize_store_info,
            PrizeRank::Second => &mut self.second_prize_store_info,
            PrizeRank::Bonus => &mut self.bonus_prize_store_info,
        }
    }

    /// Top-tier attribution is what decides draw completeness.
    pub fn top_tier_is_empty(&self) -> bool {
        self.first_prize_store_info.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.first_prize_store_info.is_empty()
            && self.second_prize_store_info.is_empty()
            && self.bonus_prize_store_info.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.first_prize_store_info.len()
            + self.second_prize_store_info.len()
            + self.bonus_prize_store_info.len()
    }
}

/// Canonical persisted draw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draw {
    pub draw_no: u32,
    pub draw_date: NaiveDate,
    #[serde(flatten)]
    pub result: DrawResult,
    pub prize_tiers: Vec<PrizeTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_sales_amount: Option<String>,
    /// Embedded top-tier winners (6/45 only); empty until the source
    /// publishes store attribution for this draw.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub first_prize_store_info: Vec<StoreWinnerInfo>,
    pub updated_at: DateTime<Utc>,
}

impl Draw {
    pub fn game_type(&self) -> GameType {
        self.result.game_type()
    }

    pub fn file_name(&self) -> String {
        self.game_type().draw_file_name(self.draw_no)
    }
}

/// A registered retail point of sale. `store_id` is immutable once
/// created; every other field may be refreshed by later lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub store_id: String,
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub lottery_types: Vec<String>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    /// Draw numbers this store sold a first/second prize ticket for,
    /// descending, deduplicated.
    #[serde(default)]
    pub first_prize_draws: Vec<u32>,
    #[serde(default)]
    pub second_prize_draws: Vec<u32>,
    #[serde(default)]
    pub first_prize_count: usize,
    #[serde(default)]
    pub second_prize_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Merge a fresh lookup into an existing registry entry. Identity is
    /// kept, descriptive fields are refreshed, win history accumulates.
    pub fn merge_from(&mut self, newer: &Store) {
        self.name = newer.name.clone();
        self.address = newer.address.clone();
        if newer.phone.is_some() {
            self.phone = newer.phone.clone();
        }
        if !newer.lottery_types.is_empty() {
            self.lottery_types = newer.lottery_types.clone();
        }
        if newer.latitude != 0.0 || newer.longitude != 0.0 {
            self.latitude = newer.latitude;
            self.longitude = newer.longitude;
        }
        for draw_no in &newer.first_prize_draws {
            self.record_win(*draw_no, PrizeRank::First);
        }
        for draw_no in &newer.second_prize_draws {
            self.record_win(*draw_no, PrizeRank::Second);
        }
        self.updated_at = newer.updated_at;
    }

    pub fn record_win(&mut self, draw_no: u32, rank: PrizeRank) {
        let history = match rank {
            PrizeRank::First => &mut self.first_prize_draws,
            PrizeRank::Second => &mut self.second_prize_draws,
            PrizeRank::Bonus => return,
        };
        if !history.contains(&draw_no) {
            history.push(draw_no);
            history.sort_unstable_by(|a, b| b.cmp(a));
        }
        self.first_prize_count = self.first_prize_draws.len();
        self.second_prize_count = self.second_prize_draws.len();
    }

    /// First two whitespace tokens of the address: province and city.
    pub fn address_parts(&self) -> (String, String) {
        let mut tokens = self.address.split_whitespace();
        let province = tokens.next().unwrap_or_default().to_string();
        let city = tokens.next().unwrap_or_default().to_string();
        (province, city)
    }
}

/// One manifest row. 6/45 entries carry the drawn numbers so list views
/// can render without opening each draw file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub draw_no: u32,
    pub draw_date: NaiveDate,
    pub file_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numbers: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonus_number: Option<u8>,
}

/// The corpus-wide catalog: strictly descending by draw number, unique,
/// and the sole authoritative ordering for consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub entries: Vec<IndexEntry>,
    pub last_updated: DateTime<Utc>,
}

impl IndexManifest {
    pub fn latest_draw_no(&self) -> Option<u32> {
        self.entries.first().map(|e| e.draw_no)
    }

    pub fn contains(&self, draw_no: u32) -> bool {
        self.entries.iter().any(|e| e.draw_no == draw_no)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletenessState {
    /// Draw persisted, top-tier store attribution not yet published.
    NumbersOnly,
    /// Top-tier store attribution present. Terminal.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryReason {
    NoIndex,
    NoDrawFile,
    ZeroStores,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::NoIndex => "no-index",
            RetryReason::NoDrawFile => "no-draw-file",
            RetryReason::ZeroStores => "zero-stores",
        }
    }
}

/// Advisory completeness verdict for one draw. The caller's scheduling
/// layer decides what to do with `needs_retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessReport {
    pub draw_no: u32,
    pub state: CompletenessState,
    pub needs_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RetryReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lotto_result() -> DrawResult {
        DrawResult::Lotto645 {
            numbers: vec![1, 2, 4, 16, 20, 32],
            bonus_number: 45,
        }
    }

    #[test]
    fn draw_result_arity_validation() {
        assert!(lotto_result().has_valid_arity());
        assert!(!DrawResult::Lotto645 {
            numbers: vec![1, 2, 3],
            bonus_number: 7,
        }
        .has_valid_arity());
        assert!(!DrawResult::Lotto645 {
            numbers: vec![1, 2, 3, 4, 5, 46],
            bonus_number: 7,
        }
        .has_valid_arity());
        assert!(DrawResult::Pension720 {
            group: "1".into(),
            numbers: vec![6, 6, 7, 9, 7, 5],
            bonus_group: "각".into(),
            bonus_numbers: vec![9, 8, 8, 4, 3, 1],
        }
        .has_valid_arity());
    }

    #[test]
    fn draw_result_round_trips_with_source_field_names() {
        let json = serde_json::to_value(lotto_result()).unwrap();
        assert_eq!(json["numbers"][0], 1);
        assert_eq!(json["bonus_number"], 45);
        let back: DrawResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, lotto_result());

        let pension = DrawResult::Pension720 {
            group: "1".into(),
            numbers: vec![6, 6, 7, 9, 7, 5],
            bonus_group: "2".into(),
            bonus_numbers: vec![9, 8, 8, 4, 3, 1],
        };
        let json = serde_json::to_value(&pension).unwrap();
        assert_eq!(json["group"], "1");
        assert_eq!(json["bonus_numbers"][5], 1);
        let back: DrawResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, pension);
    }

    #[test]
    fn store_winner_info_untagged_shapes() {
        let registered: StoreWinnerInfo =
            serde_json::from_str(r#"{"store_id":"11110635","type":"자동"}"#).unwrap();
        assert_eq!(registered.store_id(), Some("11110635"));

        let inline: StoreWinnerInfo =
            serde_json::from_str(r#"{"name":"해바라기 복권","address":"전북 군산시 축동안길"}"#)
                .unwrap();
        assert_eq!(inline.store_id(), None);
    }

    #[test]
    fn store_merge_keeps_identity_and_accumulates_history() {
        let now = Utc::now();
        let mut store = Store {
            store_id: "11110635".into(),
            name: "old name".into(),
            address: "서울 동대문구 한천로".into(),
            phone: None,
            lottery_types: vec![],
            latitude: 0.0,
            longitude: 0.0,
            first_prize_draws: vec![1150],
            second_prize_draws: vec![],
            first_prize_count: 1,
            second_prize_count: 0,
            updated_at: now,
        };
        let newer = Store {
            name: "살맛나는 세상".into(),
            phone: Some("02-2214-3463".into()),
            lottery_types: vec!["lotto645".into()],
            latitude: 37.58,
            longitude: 127.07,
            first_prize_draws: vec![1200, 1150],
            ..store.clone()
        };
        store.merge_from(&newer);
        assert_eq!(store.store_id, "11110635");
        assert_eq!(store.name, "살맛나는 세상");
        assert_eq!(store.first_prize_draws, vec![1200, 1150]);
        assert_eq!(store.first_prize_count, 2);
    }

    #[test]
    fn record_win_dedupes_and_sorts_descending() {
        let mut store = Store {
            store_id: "s".into(),
            name: "n".into(),
            address: "서울 강서구 까치산로 177".into(),
            phone: None,
            lottery_types: vec![],
            latitude: 0.0,
            longitude: 0.0,
            first_prize_draws: vec![],
            second_prize_draws: vec![],
            first_prize_count: 0,
            second_prize_count: 0,
            updated_at: Utc::now(),
        };
        store.record_win(1161, PrizeRank::First);
        store.record_win(1163, PrizeRank::First);
        store.record_win(1161, PrizeRank::First);
        assert_eq!(store.first_prize_draws, vec![1163, 1161]);
        assert_eq!(store.first_prize_count, 2);
        assert_eq!(store.address_parts(), ("서울".to_string(), "강서구".to_string()));
    }

    #[test]
    fn manifest_latest_is_first_entry() {
        let manifest = IndexManifest {
            entries: vec![
                IndexEntry {
                    draw_no: 1162,
                    draw_date: NaiveDate::from_ymd_opt(2025, 2, 8).unwrap(),
                    file_ref: "draws/lotto_1162.json".into(),
                    numbers: None,
                    bonus_number: None,
                },
                IndexEntry {
                    draw_no: 1161,
                    draw_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
                    file_ref: "draws/lotto_1161.json".into(),
                    numbers: None,
                    bonus_number: None,
                },
            ],
            last_updated: Utc::now(),
        };
        assert_eq!(manifest.latest_draw_no(), Some(1162));
        assert!(manifest.contains(1161));
        assert!(!manifest.contains(1160));
    }
}
