//! Raw payload -> canonical record transformation.
//!
//! Pure functions: no IO, no clock beyond stamping `updated_at`. Anything
//! that does not validate fails closed with `MalformedRecord`; nothing is
//! silently dropped or truncated.

use chrono::{NaiveDate, Utc};
use lotar_core::{Draw, DrawResult, PrizeRank, PrizeTier, Store, StoreWinnerInfo, StoreWinnerSet};

use crate::{
    malformed, AdapterError, RawLottoDraw, RawLottoStoreRow, RawPensionDraw, RawPensionStores,
    StoreWinnerBatch,
};

pub fn lotto_draw(raw: &RawLottoDraw) -> Result<Draw, AdapterError> {
    let draw_date = NaiveDate::parse_from_str(&raw.draw_date_ymd, "%Y%m%d")
        .map_err(|_| malformed("draw date", raw.draw_date_ymd.clone()))?;

    let numbers = raw
        .numbers
        .iter()
        .map(|n| u8::try_from(*n).ok())
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| malformed("winning numbers", format!("{:?}", raw.numbers)))?;
    let bonus_number = u8::try_from(raw.bonus_number)
        .map_err(|_| malformed("bonus number", raw.bonus_number.to_string()))?;

    let result = DrawResult::Lotto645 {
        numbers,
        bonus_number,
    };
    if !result.has_valid_arity() {
        return Err(malformed(
            format!("draw {} numbers", raw.draw_no),
            format!("{:?} + {}", raw.numbers, raw.bonus_number),
        ));
    }

    let prize_tiers = raw
        .prize_tiers
        .iter()
        .map(|tier| PrizeTier {
            rank: tier.rank.clone(),
            winner_count: tier.winner_count.clone(),
            total_prize: non_empty(&tier.total_prize),
            prize_per_winner: non_empty(&tier.prize_per_winner),
        })
        .collect();

    Ok(Draw {
        draw_no: raw.draw_no,
        draw_date,
        result,
        prize_tiers,
        total_sales_amount: non_empty(&raw.total_sales_amount),
        first_prize_store_info: Vec::new(),
        updated_at: Utc::now(),
    })
}

/// Split the rows into draw-embedded rank-1 refs and registry entries.
/// Ranks other than 1 and 2 are ignored; both kept ranks record the win in
/// the matching history so the registry merge accumulates correctly.
pub fn lotto_store_batch(rows: &[RawLottoStoreRow], draw_no: u32) -> StoreWinnerBatch {
    let mut batch = StoreWinnerBatch::default();
    for row in rows {
        let rank = match row.rank.as_str() {
            "1" => PrizeRank::First,
            "2" => PrizeRank::Second,
            _ => continue,
        };

        let mut store = Store {
            store_id: row.store_id.clone(),
            name: row.name.clone(),
            address: row.address.clone(),
            phone: row.phone.clone(),
            lottery_types: row.lottery_types.clone(),
            latitude: row.latitude,
            longitude: row.longitude,
            first_prize_draws: Vec::new(),
            second_prize_draws: Vec::new(),
            first_prize_count: 0,
            second_prize_count: 0,
            updated_at: Utc::now(),
        };
        store.record_win(draw_no, rank);
        batch.registry_updates.push(store);

        if rank == PrizeRank::First {
            batch
                .winners
                .first_prize_store_info
                .push(StoreWinnerInfo::Registered {
                    store_id: row.store_id.clone(),
                    purchase_type: row.purchase_type.clone(),
                });
        }
    }
    batch
}

pub fn pension_draw(raw: &RawPensionDraw) -> Result<Draw, AdapterError> {
    let draw_date =
        date_from_korean_text(&raw.date_text).ok_or_else(|| malformed("draw date", raw.date_text.clone()))?;

    let result = DrawResult::Pension720 {
        group: raw.group.clone(),
        numbers: parse_digits(&raw.digits)?,
        bonus_group: raw.bonus_group.clone(),
        bonus_numbers: parse_digits(&raw.bonus_digits)?,
    };
    if !result.has_valid_arity() {
        return Err(malformed(
            format!("draw {} digits", raw.draw_no),
            format!("{:?} / {:?}", raw.digits, raw.bonus_digits),
        ));
    }

    let prize_tiers = raw
        .prize_rows
        .iter()
        .map(|(rank, winner_count)| PrizeTier {
            rank: rank.clone(),
            winner_count: winner_count.clone(),
            total_prize: None,
            prize_per_winner: None,
        })
        .collect();

    Ok(Draw {
        draw_no: raw.draw_no,
        draw_date,
        result,
        prize_tiers,
        total_sales_amount: None,
        first_prize_store_info: Vec::new(),
        updated_at: Utc::now(),
    })
}

pub fn pension_store_batch(raw: &RawPensionStores) -> StoreWinnerBatch {
    let inline_rows = |pairs: &[(String, String)]| {
        pairs
            .iter()
            .map(|(name, address)| StoreWinnerInfo::Inline {
                name: name.clone(),
                address: address.clone(),
            })
            .collect()
    };
    StoreWinnerBatch {
        winners: StoreWinnerSet {
            first_prize_store_info: inline_rows(&raw.first),
            second_prize_store_info: inline_rows(&raw.second),
            bonus_prize_store_info: inline_rows(&raw.bonus),
        },
        registry_updates: Vec::new(),
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_digits(texts: &[String]) -> Result<Vec<u8>, AdapterError> {
    texts
        .iter()
        .map(|t| t.trim().parse::<u8>().ok().filter(|d| *d <= 9))
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| malformed("digit strip", format!("{texts:?}")))
}

/// "(2026년 01월 01일 추첨)" -> 2026-01-01. The first three digit runs are
/// year, month, day.
fn date_from_korean_text(text: &str) -> Option<NaiveDate> {
    let mut groups = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            groups.push(std::mem::take(&mut current));
        }
        if groups.len() == 3 {
            break;
        }
    }
    if !current.is_empty() && groups.len() < 3 {
        groups.push(current);
    }
    if groups.len() < 3 {
        return None;
    }
    NaiveDate::from_ymd_opt(
        groups[0].parse().ok()?,
        groups[1].parse().ok()?,
        groups[2].parse().ok()?,
    )
}
