//! Statistics aggregation over a draw corpus.
//!
//! One pass over `all_draws()`, deterministic and idempotent: two runs on
//! an unchanged corpus produce the same sections (only `updated_at`
//! differs). Every "most common" ordering is count-descending with ties
//! broken by key, so output order never depends on hash iteration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lotar_core::{Draw, DrawResult, GameType, StoreWinnerInfo};
use lotar_storage::{write_json_atomic, CorpusError, CorpusStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "lotar-stats";

const UNKNOWN_REGION: &str = "알 수 없음";
const UNKNOWN_PURCHASE_TYPE: &str = "알 수 없음";

#[derive(Debug, Error)]
pub enum StatsError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error("corpus has no draws to aggregate")]
    EmptyCorpus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Snapshot {
    Lotto(LottoSnapshot),
    Pension(PensionSnapshot),
}

/// Compute the snapshot for the store's game type.
pub fn compute(store: &CorpusStore) -> Result<Snapshot, StatsError> {
    match store.game() {
        GameType::Lotto645 => Ok(Snapshot::Lotto(compute_lotto(store)?)),
        GameType::Pension720 => Ok(Snapshot::Pension(compute_pension(store)?)),
    }
}

/// Compute the snapshot and replace `<corpus>/statistics.json`.
pub fn compute_and_write(store: &CorpusStore) -> Result<Snapshot, StatsError> {
    let snapshot = compute(store)?;
    write_json_atomic(&store.root().join("statistics.json"), &snapshot)?;
    Ok(snapshot)
}

/// All readable, arity-valid draws in ascending draw order, plus the count
/// of records that had to be skipped. A bad record never aborts the run.
fn collect_draws(store: &CorpusStore) -> Result<(Vec<Draw>, usize), StatsError> {
    let mut by_draw_no: BTreeMap<u32, Draw> = BTreeMap::new();
    let mut skipped = 0usize;
    for item in store.all_draws()? {
        match item {
            Ok(draw) if draw.result.has_valid_arity() => {
                by_draw_no.insert(draw.draw_no, draw);
            }
            Ok(draw) => {
                warn!(draw_no = draw.draw_no, "skipping draw with invalid number arity");
                skipped += 1;
            }
            Err(err) => {
                warn!(%err, "skipping unreadable draw record");
                skipped += 1;
            }
        }
    }
    Ok((by_draw_no.into_values().collect(), skipped))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(count as f64 * 100.0 / total as f64)
    }
}

fn first_address_token(address: &str) -> String {
    address
        .split_whitespace()
        .next()
        .unwrap_or(UNKNOWN_REGION)
        .to_string()
}

/// Count-descending, key-ascending ordering. The input map is already
/// key-ascending, so a stable sort by count gives the tie-break for free.
fn ranked_buckets<K: Clone>(counts: &BTreeMap<K, usize>) -> Vec<(K, usize)> {
    let mut out: Vec<(K, usize)> = counts.iter().map(|(k, c)| (k.clone(), *c)).collect();
    out.sort_by(|a, b| b.1.cmp(&a.1));
    out
}

// ---------------------------------------------------------------------------
// Shared bucket shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternBucket {
    pub pattern: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternGroup {
    pub total: usize,
    pub stats: Vec<PatternBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionBucket {
    pub region: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreBucket {
    pub name: String,
    pub count: usize,
}

// ---------------------------------------------------------------------------
// Lotto 6/45 snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LottoSnapshot {
    pub total_draws: usize,
    pub first_draw: Option<u32>,
    pub last_draw: Option<u32>,
    pub skipped_draws: usize,
    pub frequency_stats: LottoFrequencyStats,
    pub pattern_stats: LottoPatternStats,
    pub gap_stats: GapStats,
    pub sum_stats: SumStats,
    pub store_stats: LottoStoreStats,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberFrequency {
    pub number: u8,
    pub frequency: usize,
    pub regular_frequency: usize,
    pub bonus_frequency: usize,
    /// Total appearances over 7 slots per draw.
    pub percentage: f64,
    /// Regular appearances over 6 slots per draw.
    pub regular_percentage: f64,
    /// Bonus appearances over one slot per draw.
    pub bonus_percentage: f64,
    /// Share of draws this number appeared in as a regular number.
    pub appearance_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LottoFrequencyStats {
    pub all_numbers_frequency: Vec<NumberFrequency>,
    pub most_frequent_numbers: Vec<NumberFrequency>,
    pub least_frequent_numbers: Vec<NumberFrequency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsecutivePairBucket {
    pub pair: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsecutiveStats {
    pub average: f64,
    pub max: u32,
    pub min: u32,
    pub draws_with_consecutive: usize,
    pub draws_with_consecutive_percentage: f64,
    pub draws_with_multiple_consecutive: usize,
    pub draws_with_multiple_consecutive_percentage: f64,
    pub top_consecutive_pairs: Vec<ConsecutivePairBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LottoPatternStats {
    pub odd_even_stats: PatternGroup,
    pub range_stats: PatternGroup,
    pub consecutive_stats: ConsecutiveStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapBucket {
    pub gap: u8,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawGap {
    pub draw_no: u32,
    pub avg_gap: f64,
}

/// Spacing between adjacent sorted numbers within each draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapStats {
    /// Every observed gap size, ascending; percentages over the total
    /// number of gaps (5 per draw).
    pub gap_distribution: Vec<GapBucket>,
    pub most_common_gaps: Vec<GapBucket>,
    pub overall_avg_gap: f64,
    pub recent_avg_gaps: Vec<DrawGap>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumBucket {
    pub sum: u32,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumStats {
    pub sum_distribution: Vec<PatternBucket>,
    pub most_common_sums: Vec<SumBucket>,
    pub overall_avg_sum: f64,
    pub min_sum: u32,
    pub max_sum: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseTypeBucket {
    #[serde(rename = "type")]
    pub purchase_type: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LottoStoreStats {
    /// Every embedded winner row, resolved or not. The bucketed counts
    /// below plus `unresolved` sum to this.
    pub total_rows: usize,
    pub region_stats: Vec<RegionBucket>,
    pub top_stores: Vec<StoreBucket>,
    pub type_stats: Vec<PurchaseTypeBucket>,
    pub unresolved: usize,
}

pub fn compute_lotto(store: &CorpusStore) -> Result<LottoSnapshot, StatsError> {
    let (draws, skipped_draws) = collect_draws(store)?;
    if draws.is_empty() {
        return Err(StatsError::EmptyCorpus);
    }

    Ok(LottoSnapshot {
        total_draws: draws.len(),
        first_draw: draws.first().map(|d| d.draw_no),
        last_draw: draws.last().map(|d| d.draw_no),
        skipped_draws,
        frequency_stats: lotto_frequency(&draws),
        pattern_stats: lotto_patterns(&draws),
        gap_stats: lotto_gaps(&draws),
        sum_stats: lotto_sums(&draws),
        store_stats: lotto_store_stats(store, &draws)?,
        updated_at: Utc::now(),
    })
}

fn lotto_numbers(draw: &Draw) -> (&[u8], u8) {
    match &draw.result {
        DrawResult::Lotto645 {
            numbers,
            bonus_number,
        } => (numbers, *bonus_number),
        DrawResult::Pension720 { .. } => (&[], 0),
    }
}

fn lotto_frequency(draws: &[Draw]) -> LottoFrequencyStats {
    let mut regular = [0usize; 46];
    let mut bonus = [0usize; 46];
    for draw in draws {
        let (numbers, bonus_number) = lotto_numbers(draw);
        for n in numbers {
            regular[*n as usize] += 1;
        }
        bonus[bonus_number as usize] += 1;
    }

    let total_draws = draws.len();
    let mut all: Vec<NumberFrequency> = (1u8..=45)
        .map(|number| {
            let regular_frequency = regular[number as usize];
            let bonus_frequency = bonus[number as usize];
            let frequency = regular_frequency + bonus_frequency;
            NumberFrequency {
                number,
                frequency,
                regular_frequency,
                bonus_frequency,
                percentage: percentage(frequency, total_draws * 7),
                regular_percentage: percentage(regular_frequency, total_draws * 6),
                bonus_percentage: percentage(bonus_frequency, total_draws),
                appearance_percentage: percentage(regular_frequency, total_draws),
            }
        })
        .collect();
    // Already number-ascending; the stable sort keeps that as the tie-break.
    all.sort_by(|a, b| b.frequency.cmp(&a.frequency));

    let most_frequent_numbers = all.iter().take(5).cloned().collect();
    let least_frequent_numbers = all.iter().rev().take(5).rev().cloned().collect();
    LottoFrequencyStats {
        all_numbers_frequency: all,
        most_frequent_numbers,
        least_frequent_numbers,
    }
}

fn consecutive_pairs(numbers: &[u8]) -> Vec<(u8, u8)> {
    let mut sorted = numbers.to_vec();
    sorted.sort_unstable();
    sorted
        .windows(2)
        .filter(|w| w[1] == w[0] + 1)
        .map(|w| (w[0], w[1]))
        .collect()
}

fn lotto_patterns(draws: &[Draw]) -> LottoPatternStats {
    let total = draws.len();
    let mut odd_even: BTreeMap<String, usize> = BTreeMap::new();
    let mut ranges: BTreeMap<String, usize> = BTreeMap::new();
    let mut pair_counts: BTreeMap<(u8, u8), usize> = BTreeMap::new();
    let mut per_draw_counts: Vec<u32> = Vec::with_capacity(total);
    let mut draws_with_consecutive = 0usize;
    let mut draws_with_multiple = 0usize;

    for draw in draws {
        let (numbers, _) = lotto_numbers(draw);

        let odd = numbers.iter().filter(|n| *n % 2 == 1).count();
        *odd_even.entry(format!("{odd}:{}", numbers.len() - odd)).or_default() += 1;

        // Bands 1-9 / 10-19 / 20-29 / 30-39 / 40-45.
        let mut bands = [0usize; 5];
        for n in numbers {
            let band = match n {
                1..=9 => 0,
                10..=19 => 1,
                20..=29 => 2,
                30..=39 => 3,
                _ => 4,
            };
            bands[band] += 1;
        }
        let key = format!(
            "{}-{}-{}-{}-{}",
            bands[0], bands[1], bands[2], bands[3], bands[4]
        );
        *ranges.entry(key).or_default() += 1;

        let pairs = consecutive_pairs(numbers);
        per_draw_counts.push(pairs.len() as u32);
        if !pairs.is_empty() {
            draws_with_consecutive += 1;
        }
        if pairs.len() >= 2 {
            draws_with_multiple += 1;
        }
        for pair in pairs {
            *pair_counts.entry(pair).or_default() += 1;
        }
    }

    let pattern_group = |counts: &BTreeMap<String, usize>| PatternGroup {
        total,
        stats: ranked_buckets(counts)
            .into_iter()
            .map(|(pattern, count)| PatternBucket {
                pattern,
                count,
                percentage: percentage(count, total),
            })
            .collect(),
    };

    let total_pair_count: u32 = per_draw_counts.iter().sum();
    let consecutive_stats = ConsecutiveStats {
        average: round2(total_pair_count as f64 / total as f64),
        max: per_draw_counts.iter().copied().max().unwrap_or(0),
        min: per_draw_counts.iter().copied().min().unwrap_or(0),
        draws_with_consecutive,
        draws_with_consecutive_percentage: percentage(draws_with_consecutive, total),
        draws_with_multiple_consecutive: draws_with_multiple,
        draws_with_multiple_consecutive_percentage: percentage(draws_with_multiple, total),
        top_consecutive_pairs: ranked_buckets(&pair_counts)
            .into_iter()
            .take(10)
            .map(|((a, b), count)| ConsecutivePairBucket {
                pair: format!("{a}-{b}"),
                count,
                percentage: percentage(count, total),
            })
            .collect(),
    };

    LottoPatternStats {
        odd_even_stats: pattern_group(&odd_even),
        range_stats: pattern_group(&ranges),
        consecutive_stats,
    }
}

fn lotto_gaps(draws: &[Draw]) -> GapStats {
    let mut gap_counts: BTreeMap<u8, usize> = BTreeMap::new();
    let mut avg_gaps: Vec<DrawGap> = Vec::with_capacity(draws.len());

    for draw in draws {
        let mut numbers = lotto_numbers(draw).0.to_vec();
        numbers.sort_unstable();
        let gaps: Vec<u8> = numbers.windows(2).map(|w| w[1] - w[0]).collect();
        for gap in &gaps {
            *gap_counts.entry(*gap).or_default() += 1;
        }
        let avg = gaps.iter().map(|g| f64::from(*g)).sum::<f64>() / gaps.len().max(1) as f64;
        avg_gaps.push(DrawGap {
            draw_no: draw.draw_no,
            avg_gap: round2(avg),
        });
    }

    let total_gaps: usize = gap_counts.values().sum();
    let bucket = |(gap, count): (u8, usize)| GapBucket {
        gap,
        count,
        percentage: percentage(count, total_gaps),
    };

    let gap_distribution = gap_counts.iter().map(|(g, c)| bucket((*g, *c))).collect();
    let most_common_gaps = ranked_buckets(&gap_counts)
        .into_iter()
        .take(5)
        .map(bucket)
        .collect();
    let overall_avg_gap =
        round2(avg_gaps.iter().map(|d| d.avg_gap).sum::<f64>() / avg_gaps.len().max(1) as f64);
    let recent_start = avg_gaps.len().saturating_sub(10);
    let recent_avg_gaps = avg_gaps[recent_start..].to_vec();

    GapStats {
        gap_distribution,
        most_common_gaps,
        overall_avg_gap,
        recent_avg_gaps,
    }
}

const SUM_BANDS: [(&str, u32, u32); 8] = [
    ("70-90", 70, 90),
    ("91-110", 91, 110),
    ("111-130", 111, 130),
    ("131-150", 131, 150),
    ("151-170", 151, 170),
    ("171-190", 171, 190),
    ("191-210", 191, 210),
    ("211-230", 211, 230),
];

fn lotto_sums(draws: &[Draw]) -> SumStats {
    let total = draws.len();
    let mut sum_counts: BTreeMap<u32, usize> = BTreeMap::new();
    let mut band_counts = vec![0usize; SUM_BANDS.len() + 1];

    for draw in draws {
        let (numbers, _) = lotto_numbers(draw);
        let sum: u32 = numbers.iter().map(|n| u32::from(*n)).sum();
        *sum_counts.entry(sum).or_default() += 1;

        let band = SUM_BANDS
            .iter()
            .position(|(_, lo, hi)| (*lo..=*hi).contains(&sum))
            .unwrap_or(SUM_BANDS.len());
        band_counts[band] += 1;
    }

    let sum_distribution = SUM_BANDS
        .iter()
        .map(|(name, _, _)| *name)
        .chain(std::iter::once("기타"))
        .zip(band_counts.iter())
        .filter(|(_, count)| **count > 0)
        .map(|(name, count)| PatternBucket {
            pattern: name.to_string(),
            count: *count,
            percentage: percentage(*count, total),
        })
        .collect();

    let all_sums: Vec<u32> = sum_counts
        .iter()
        .flat_map(|(sum, count)| std::iter::repeat(*sum).take(*count))
        .collect();
    let overall_avg_sum = round2(all_sums.iter().map(|s| *s as f64).sum::<f64>() / total as f64);

    SumStats {
        sum_distribution,
        most_common_sums: ranked_buckets(&sum_counts)
            .into_iter()
            .take(10)
            .map(|(sum, count)| SumBucket {
                sum,
                count,
                percentage: percentage(count, total),
            })
            .collect(),
        overall_avg_sum,
        min_sum: all_sums.iter().copied().min().unwrap_or(0),
        max_sum: all_sums.iter().copied().max().unwrap_or(0),
    }
}

/// Join the draw-embedded rank-1 refs against the store registry. Refs the
/// registry cannot resolve land in `unresolved` so the buckets still
/// account for every winner row.
fn lotto_store_stats(store: &CorpusStore, draws: &[Draw]) -> Result<LottoStoreStats, StatsError> {
    let registry = store.store_registry()?;

    let mut region_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut store_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut type_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_rows = 0usize;
    let mut unresolved = 0usize;

    for draw in draws {
        for winner in &draw.first_prize_store_info {
            total_rows += 1;
            let StoreWinnerInfo::Registered {
                store_id,
                purchase_type,
            } = winner
            else {
                unresolved += 1;
                continue;
            };
            let Some(entry) = registry.get(store_id) else {
                unresolved += 1;
                continue;
            };
            *region_counts
                .entry(first_address_token(&entry.address))
                .or_default() += 1;
            *store_counts.entry(entry.name.clone()).or_default() += 1;
            let type_key = if purchase_type.is_empty() {
                UNKNOWN_PURCHASE_TYPE.to_string()
            } else {
                purchase_type.clone()
            };
            *type_counts.entry(type_key).or_default() += 1;
        }
    }

    Ok(LottoStoreStats {
        total_rows,
        region_stats: ranked_buckets(&region_counts)
            .into_iter()
            .map(|(region, count)| RegionBucket {
                region,
                count,
                percentage: percentage(count, total_rows),
            })
            .collect(),
        top_stores: ranked_buckets(&store_counts)
            .into_iter()
            .take(10)
            .map(|(name, count)| StoreBucket { name, count })
            .collect(),
        type_stats: ranked_buckets(&type_counts)
            .into_iter()
            .map(|(purchase_type, count)| PurchaseTypeBucket {
                purchase_type,
                count,
                percentage: percentage(count, total_rows),
            })
            .collect(),
        unresolved,
    })
}

// ---------------------------------------------------------------------------
// Pension 720+ snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PensionSnapshot {
    pub total_draws: usize,
    pub first_draw: Option<u32>,
    pub last_draw: Option<u32>,
    pub skipped_draws: usize,
    pub frequency_stats: PensionFrequencyStats,
    pub prize_stats: PensionPrizeStats,
    pub store_stats: PensionStoreStats,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBucket {
    pub group: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitBucket {
    pub number: u8,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFrequency {
    pub position: usize,
    pub stats: Vec<DigitBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PensionFrequencyStats {
    pub group_frequency: Vec<GroupBucket>,
    pub position_frequency: Vec<PositionFrequency>,
    pub bonus_frequency: Vec<PositionFrequency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankBucket {
    pub rank: String,
    pub average_winners: f64,
    pub max_winners: u64,
    pub min_winners: u64,
    pub total_winners: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PensionPrizeStats {
    pub rank_stats: Vec<RankBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PensionStoreStats {
    pub total_rows: usize,
    pub region_stats: Vec<RegionBucket>,
    pub top_stores: Vec<StoreBucket>,
}

pub fn compute_pension(store: &CorpusStore) -> Result<PensionSnapshot, StatsError> {
    let (draws, skipped_draws) = collect_draws(store)?;
    if draws.is_empty() {
        return Err(StatsError::EmptyCorpus);
    }

    Ok(PensionSnapshot {
        total_draws: draws.len(),
        first_draw: draws.first().map(|d| d.draw_no),
        last_draw: draws.last().map(|d| d.draw_no),
        skipped_draws,
        frequency_stats: pension_frequency(&draws),
        prize_stats: pension_prizes(&draws),
        store_stats: pension_store_stats(store, &draws)?,
        updated_at: Utc::now(),
    })
}

fn pension_frequency(draws: &[Draw]) -> PensionFrequencyStats {
    let total_draws = draws.len();
    let mut group_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut position_counts = vec![BTreeMap::<u8, usize>::new(); 6];
    let mut bonus_counts = vec![BTreeMap::<u8, usize>::new(); 6];

    for draw in draws {
        let DrawResult::Pension720 {
            group,
            numbers,
            bonus_numbers,
            ..
        } = &draw.result
        else {
            continue;
        };
        *group_counts.entry(group.clone()).or_default() += 1;
        for (i, digit) in numbers.iter().enumerate() {
            *position_counts[i].entry(*digit).or_default() += 1;
        }
        for (i, digit) in bonus_numbers.iter().enumerate() {
            *bonus_counts[i].entry(*digit).or_default() += 1;
        }
    }

    PensionFrequencyStats {
        group_frequency: ranked_buckets(&group_counts)
            .into_iter()
            .map(|(group, count)| GroupBucket {
                group,
                count,
                percentage: percentage(count, total_draws),
            })
            .collect(),
        position_frequency: position_frequency(&position_counts, total_draws),
        bonus_frequency: position_frequency(&bonus_counts, total_draws),
    }
}

fn position_frequency(
    counters: &[BTreeMap<u8, usize>],
    total_draws: usize,
) -> Vec<PositionFrequency> {
    counters
        .iter()
        .enumerate()
        .map(|(i, counts)| PositionFrequency {
            position: i + 1,
            stats: ranked_buckets(counts)
                .into_iter()
                .map(|(number, count)| DigitBucket {
                    number,
                    count,
                    percentage: percentage(count, total_draws),
                })
                .collect(),
        })
        .collect()
}

fn pension_prizes(draws: &[Draw]) -> PensionPrizeStats {
    let mut by_rank: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for draw in draws {
        for tier in &draw.prize_tiers {
            let count = tier
                .winner_count
                .replace(',', "")
                .trim()
                .parse::<u64>()
                .unwrap_or(0);
            by_rank.entry(tier.rank.clone()).or_default().push(count);
        }
    }

    let rank_stats = by_rank
        .into_iter()
        .map(|(rank, counts)| {
            let total: u64 = counts.iter().sum();
            RankBucket {
                rank,
                average_winners: round2(total as f64 / counts.len() as f64),
                max_winners: counts.iter().copied().max().unwrap_or(0),
                min_winners: counts.iter().copied().min().unwrap_or(0),
                total_winners: total,
            }
        })
        .collect();
    PensionPrizeStats { rank_stats }
}

/// All three inline tables of each draw's store listing feed the counters.
fn pension_store_stats(
    store: &CorpusStore,
    draws: &[Draw],
) -> Result<PensionStoreStats, StatsError> {
    let mut region_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut store_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_rows = 0usize;

    for draw in draws {
        let Some(set) = store.load_store_winners(draw.draw_no)? else {
            continue;
        };
        let all_rows = set
            .first_prize_store_info
            .iter()
            .chain(&set.second_prize_store_info)
            .chain(&set.bonus_prize_store_info);
        for row in all_rows {
            let StoreWinnerInfo::Inline { name, address } = row else {
                warn!(draw_no = draw.draw_no, "ignoring non-inline store row");
                continue;
            };
            total_rows += 1;
            *region_counts
                .entry(first_address_token(address))
                .or_default() += 1;
            *store_counts.entry(name.clone()).or_default() += 1;
        }
    }

    Ok(PensionStoreStats {
        total_rows,
        region_stats: ranked_buckets(&region_counts)
            .into_iter()
            .map(|(region, count)| RegionBucket {
                region,
                count,
                percentage: percentage(count, total_rows),
            })
            .collect(),
        top_stores: ranked_buckets(&store_counts)
            .into_iter()
            .take(10)
            .map(|(name, count)| StoreBucket { name, count })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lotar_core::{PrizeRank, PrizeTier, Store};
    use tempfile::tempdir;

    fn lotto_draw(draw_no: u32, numbers: Vec<u8>, bonus: u8) -> Draw {
        Draw {
            draw_no,
            draw_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            result: DrawResult::Lotto645 {
                numbers,
                bonus_number: bonus,
            },
            prize_tiers: Vec::new(),
            total_sales_amount: None,
            first_prize_store_info: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    fn pension_draw(draw_no: u32, digits: Vec<u8>, bonus: Vec<u8>) -> Draw {
        Draw {
            draw_no,
            draw_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            result: DrawResult::Pension720 {
                group: "1".into(),
                numbers: digits,
                bonus_group: "각".into(),
                bonus_numbers: bonus,
            },
            prize_tiers: vec![PrizeTier {
                rank: "1등".into(),
                winner_count: "1".into(),
                total_prize: None,
                prize_per_winner: None,
            }],
            total_sales_amount: None,
            first_prize_store_info: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    fn two_draw_lotto_store(dir: &std::path::Path) -> CorpusStore {
        let store = CorpusStore::open(dir, GameType::Lotto645).unwrap();
        store
            .upsert_draw(&lotto_draw(1161, vec![1, 2, 3, 4, 5, 6], 7))
            .unwrap();
        store
            .upsert_draw(&lotto_draw(1162, vec![20, 21, 22, 25, 28, 29], 6))
            .unwrap();
        store
    }

    #[test]
    fn frequency_counts_over_two_disjoint_draws() {
        let dir = tempdir().unwrap();
        let store = two_draw_lotto_store(dir.path());
        let snapshot = compute_lotto(&store).unwrap();

        assert_eq!(snapshot.total_draws, 2);
        assert_eq!(snapshot.first_draw, Some(1161));
        assert_eq!(snapshot.last_draw, Some(1162));
        assert_eq!(snapshot.skipped_draws, 0);

        let twenty = snapshot
            .frequency_stats
            .all_numbers_frequency
            .iter()
            .find(|f| f.number == 20)
            .unwrap();
        assert_eq!(twenty.regular_frequency, 1);
        // One appearance across two draws.
        assert_eq!(twenty.appearance_percentage, 50.00);
        assert_eq!(twenty.regular_percentage, 8.33);

        // Bonus number 6 is also a regular number in draw 1162.
        let six = snapshot
            .frequency_stats
            .all_numbers_frequency
            .iter()
            .find(|f| f.number == 6)
            .unwrap();
        assert_eq!(six.frequency, 2);
        assert_eq!(six.bonus_frequency, 1);
    }

    #[test]
    fn pattern_and_sum_sections_match_hand_computation() {
        let dir = tempdir().unwrap();
        let store = two_draw_lotto_store(dir.path());
        let snapshot = compute_lotto(&store).unwrap();

        let odd_even = &snapshot.pattern_stats.odd_even_stats;
        assert_eq!(odd_even.total, 2);
        // [1,2,3,4,5,6] is 3:3, [20,21,22,25,28,29] is 3:3.
        assert_eq!(odd_even.stats.len(), 1);
        assert_eq!(odd_even.stats[0].pattern, "3:3");
        assert_eq!(odd_even.stats[0].percentage, 100.00);

        let ranges = &snapshot.pattern_stats.range_stats;
        assert_eq!(ranges.stats.len(), 2);
        // Ties broken by pattern key, ascending.
        assert_eq!(ranges.stats[0].pattern, "0-0-6-0-0");
        assert_eq!(ranges.stats[1].pattern, "6-0-0-0-0");

        let consecutive = &snapshot.pattern_stats.consecutive_stats;
        // 1161 has 5 consecutive pairs, 1162 has 3 (20-21, 21-22, 28-29).
        assert_eq!(consecutive.max, 5);
        assert_eq!(consecutive.min, 3);
        assert_eq!(consecutive.average, 4.00);
        assert_eq!(consecutive.draws_with_consecutive, 2);
        assert_eq!(consecutive.draws_with_consecutive_percentage, 100.00);

        let sums = &snapshot.sum_stats;
        // 21 and 145.
        assert_eq!(sums.min_sum, 21);
        assert_eq!(sums.max_sum, 145);
        assert_eq!(sums.overall_avg_sum, 83.00);
        assert!(sums
            .sum_distribution
            .iter()
            .any(|b| b.pattern == "기타" && b.count == 1));
        assert!(sums
            .sum_distribution
            .iter()
            .any(|b| b.pattern == "131-150" && b.count == 1));
    }

    #[test]
    fn aggregation_is_deterministic_on_unchanged_corpus() {
        let dir = tempdir().unwrap();
        let store = two_draw_lotto_store(dir.path());

        let a = compute_lotto(&store).unwrap();
        let b = compute_lotto(&store).unwrap();
        assert_eq!(a.frequency_stats, b.frequency_stats);
        assert_eq!(a.pattern_stats, b.pattern_stats);
        assert_eq!(a.gap_stats, b.gap_stats);
        assert_eq!(a.sum_stats, b.sum_stats);
        assert_eq!(a.store_stats, b.store_stats);
    }

    #[test]
    fn gap_stats_count_adjacent_number_spacing() {
        let dir = tempdir().unwrap();
        let store = two_draw_lotto_store(dir.path());
        let snapshot = compute_lotto(&store).unwrap();

        let gaps = &snapshot.gap_stats;
        // 1161 contributes five gaps of 1; 1162 contributes [1,1,3,3,1].
        assert_eq!(gaps.gap_distribution.len(), 2);
        assert_eq!(gaps.gap_distribution[0].gap, 1);
        assert_eq!(gaps.gap_distribution[0].count, 8);
        assert_eq!(gaps.gap_distribution[0].percentage, 80.00);
        assert_eq!(gaps.gap_distribution[1].gap, 3);
        assert_eq!(gaps.gap_distribution[1].count, 2);

        assert_eq!(gaps.most_common_gaps[0].gap, 1);
        // Per-draw averages are 1.0 and 1.8.
        assert_eq!(gaps.overall_avg_gap, 1.40);
        assert_eq!(gaps.recent_avg_gaps.len(), 2);
        assert_eq!(gaps.recent_avg_gaps[1].draw_no, 1162);
        assert_eq!(gaps.recent_avg_gaps[1].avg_gap, 1.80);
    }

    #[test]
    fn zero_store_draw_counts_in_frequency_but_not_store_rankings() {
        let dir = tempdir().unwrap();
        let store = two_draw_lotto_store(dir.path());
        store
            .upsert_draw(&lotto_draw(1163, vec![8, 11, 19, 21, 36, 45], 2))
            .unwrap();

        let registry_entry = Store {
            store_id: "11110635".into(),
            name: "살맛나는 세상".into(),
            address: "서울 동대문구 한천로46길 56-4".into(),
            phone: None,
            lottery_types: vec!["lotto645".into()],
            latitude: 0.0,
            longitude: 0.0,
            first_prize_draws: vec![1162],
            second_prize_draws: vec![],
            first_prize_count: 1,
            second_prize_count: 0,
            updated_at: Utc::now(),
        };
        store.upsert_store(&registry_entry).unwrap();
        store
            .upsert_store_winners(
                1162,
                PrizeRank::First,
                &[StoreWinnerInfo::Registered {
                    store_id: "11110635".into(),
                    purchase_type: "자동".into(),
                }],
            )
            .unwrap();

        let snapshot = compute_lotto(&store).unwrap();
        assert_eq!(snapshot.total_draws, 3);
        // Draw 1163 contributes numbers but no winner rows.
        assert_eq!(snapshot.store_stats.total_rows, 1);
        assert_eq!(snapshot.store_stats.unresolved, 0);
        assert_eq!(snapshot.store_stats.region_stats[0].region, "서울");
        assert_eq!(snapshot.store_stats.type_stats[0].purchase_type, "자동");
        assert_eq!(snapshot.store_stats.top_stores[0].name, "살맛나는 세상");
    }

    #[test]
    fn unresolved_refs_are_bucketed_not_dropped() {
        let dir = tempdir().unwrap();
        let store = two_draw_lotto_store(dir.path());
        store
            .upsert_store_winners(
                1161,
                PrizeRank::First,
                &[StoreWinnerInfo::Registered {
                    store_id: "99999999".into(),
                    purchase_type: "수동".into(),
                }],
            )
            .unwrap();

        let snapshot = compute_lotto(&store).unwrap();
        assert_eq!(snapshot.store_stats.total_rows, 1);
        assert_eq!(snapshot.store_stats.unresolved, 1);
        assert!(snapshot.store_stats.region_stats.is_empty());
    }

    #[test]
    fn pension_position_counts_sum_to_total_draws() {
        let dir = tempdir().unwrap();
        let store = CorpusStore::open(dir.path(), GameType::Pension720).unwrap();
        store
            .upsert_draw(&pension_draw(295, vec![1, 2, 3, 4, 5, 6], vec![0, 0, 0, 0, 0, 0]))
            .unwrap();
        store
            .upsert_draw(&pension_draw(296, vec![6, 6, 7, 9, 7, 5], vec![9, 8, 8, 4, 3, 1]))
            .unwrap();

        let snapshot = compute_pension(&store).unwrap();
        assert_eq!(snapshot.total_draws, 2);
        for position in &snapshot.frequency_stats.position_frequency {
            let total: usize = position.stats.iter().map(|s| s.count).sum();
            assert_eq!(total, snapshot.total_draws);
        }

        let rank = &snapshot.prize_stats.rank_stats[0];
        assert_eq!(rank.rank, "1등");
        assert_eq!(rank.total_winners, 2);
        assert_eq!(rank.average_winners, 1.00);
    }

    #[test]
    fn pension_store_stats_cover_all_three_tables() {
        let dir = tempdir().unwrap();
        let store = CorpusStore::open(dir.path(), GameType::Pension720).unwrap();
        store
            .upsert_draw(&pension_draw(296, vec![6, 6, 7, 9, 7, 5], vec![9, 8, 8, 4, 3, 1]))
            .unwrap();
        let inline = |name: &str, address: &str| StoreWinnerInfo::Inline {
            name: name.into(),
            address: address.into(),
        };
        store
            .upsert_store_winners(296, PrizeRank::First, &[inline("해바라기 복권", "전북 군산시 축동안길")])
            .unwrap();
        store
            .upsert_store_winners(296, PrizeRank::Second, &[inline("대박복권방", "서울 강서구 까치산로")])
            .unwrap();
        store
            .upsert_store_winners(296, PrizeRank::Bonus, &[inline("현풍로또명당", "대구 달성군 현풍읍")])
            .unwrap();

        let snapshot = compute_pension(&store).unwrap();
        assert_eq!(snapshot.store_stats.total_rows, 3);
        assert_eq!(snapshot.store_stats.region_stats.len(), 3);
        assert_eq!(snapshot.store_stats.top_stores.len(), 3);
    }

    #[test]
    fn invalid_arity_draw_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let store = two_draw_lotto_store(dir.path());
        store
            .upsert_draw(&lotto_draw(1163, vec![1, 2, 3], 7))
            .unwrap();

        let snapshot = compute_lotto(&store).unwrap();
        assert_eq!(snapshot.total_draws, 2);
        assert_eq!(snapshot.skipped_draws, 1);
    }

    #[test]
    fn snapshot_file_is_replaced_in_place() {
        let dir = tempdir().unwrap();
        let store = two_draw_lotto_store(dir.path());

        compute_and_write(&store).unwrap();
        let path = store.root().join("statistics.json");
        let first: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(first["total_draws"], 2);

        store
            .upsert_draw(&lotto_draw(1163, vec![8, 11, 19, 21, 36, 45], 2))
            .unwrap();
        compute_and_write(&store).unwrap();
        let second: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(second["total_draws"], 3);
    }
}
