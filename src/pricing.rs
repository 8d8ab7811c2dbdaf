use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::limits::ALTERNATIVE_DATE_WINDOW;
use crate::model::{NightlyPrice, RatePlanId, RoomTypeId, StayRange};

/// Calendar entry: which rate tier applies on a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateTierDay {
    pub date: NaiveDate,
    pub tier: String,
}

/// Matrix entry: nightly price for (room type, rate plan, tier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub room_type_id: RoomTypeId,
    pub rate_plan_id: RatePlanId,
    pub tier: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub nightly: Vec<NightlyPrice>,
    pub total: Decimal,
    pub average_per_night: Decimal,
}

/// Rate-tier calendar plus pricing matrix.
///
/// A date with no tier, or a tier with no matrix entry, prices at zero so
/// gaps in pricing data never block a search or a booking.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    calendar: BTreeMap<NaiveDate, String>,
    matrix: HashMap<(RoomTypeId, RatePlanId, String), Decimal>,
}

impl PricingTable {
    pub fn new(calendar: &[RateTierDay], matrix: &[PriceEntry]) -> Self {
        Self {
            calendar: calendar
                .iter()
                .map(|d| (d.date, d.tier.clone()))
                .collect(),
            matrix: matrix
                .iter()
                .map(|e| ((e.room_type_id, e.rate_plan_id, e.tier.clone()), e.price))
                .collect(),
        }
    }

    pub fn tier_on(&self, date: NaiveDate) -> Option<&str> {
        self.calendar.get(&date).map(String::as_str)
    }

    pub fn nightly_price(
        &self,
        room_type_id: RoomTypeId,
        rate_plan_id: RatePlanId,
        date: NaiveDate,
    ) -> Decimal {
        let Some(tier) = self.tier_on(date) else {
            return Decimal::ZERO;
        };
        self.matrix
            .get(&(room_type_id, rate_plan_id, tier.to_string()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn quote(
        &self,
        room_type_id: RoomTypeId,
        rate_plan_id: RatePlanId,
        stay: StayRange,
    ) -> Quote {
        let nightly: Vec<NightlyPrice> = stay
            .dates()
            .map(|date| NightlyPrice {
                date,
                price: self.nightly_price(room_type_id, rate_plan_id, date),
            })
            .collect();
        let total: Decimal = nightly.iter().map(|n| n.price).sum();
        let nights = Decimal::from(stay.nights());
        let average_per_night = if nights.is_zero() {
            Decimal::ZERO
        } else {
            (total / nights).round_dp(2)
        };
        Quote {
            nightly,
            total,
            average_per_night,
        }
    }
}

/// Check-in dates to propose when a search comes back empty: the window
/// before and after `check_in`, skipping anything before `today`.
pub fn alternative_dates(check_in: NaiveDate, today: NaiveDate) -> Vec<NaiveDate> {
    (-ALTERNATIVE_DATE_WINDOW..=ALTERNATIVE_DATE_WINDOW)
        .filter(|offset| *offset != 0)
        .map(|offset| check_in + Duration::days(offset))
        .filter(|date| *date >= today)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn table() -> PricingTable {
        PricingTable::new(
            &[
                RateTierDay {
                    date: d(2026, 7, 1),
                    tier: "low".into(),
                },
                RateTierDay {
                    date: d(2026, 7, 2),
                    tier: "high".into(),
                },
                RateTierDay {
                    date: d(2026, 7, 3),
                    tier: "high".into(),
                },
                RateTierDay {
                    date: d(2026, 7, 4),
                    tier: "peak".into(),
                },
            ],
            &[
                PriceEntry {
                    room_type_id: 1,
                    rate_plan_id: 1,
                    tier: "low".into(),
                    price: Decimal::new(10000, 2),
                },
                PriceEntry {
                    room_type_id: 1,
                    rate_plan_id: 1,
                    tier: "high".into(),
                    price: Decimal::new(15050, 2),
                },
                PriceEntry {
                    room_type_id: 2,
                    rate_plan_id: 1,
                    tier: "low".into(),
                    price: Decimal::new(20000, 2),
                },
            ],
        )
    }

    #[test]
    fn quote_sums_nightly_prices() {
        let q = table().quote(1, 1, StayRange::new(d(2026, 7, 1), d(2026, 7, 4)));
        assert_eq!(q.nightly.len(), 3);
        assert_eq!(q.nightly[0].price, Decimal::new(10000, 2));
        assert_eq!(q.nightly[1].price, Decimal::new(15050, 2));
        assert_eq!(q.total, Decimal::new(40100, 2));
        assert_eq!(q.average_per_night, Decimal::new(13367, 2));
    }

    #[test]
    fn missing_tier_or_matrix_entry_prices_zero() {
        let t = table();
        // 2026-07-04 is "peak" but the matrix has no peak price
        assert_eq!(t.nightly_price(1, 1, d(2026, 7, 4)), Decimal::ZERO);
        // 2026-07-10 has no tier at all
        assert_eq!(t.nightly_price(1, 1, d(2026, 7, 10)), Decimal::ZERO);
        // unknown rate plan
        assert_eq!(t.nightly_price(1, 99, d(2026, 7, 1)), Decimal::ZERO);

        let q = t.quote(2, 1, StayRange::new(d(2026, 7, 1), d(2026, 7, 3)));
        assert_eq!(q.total, Decimal::new(20000, 2));
        assert_eq!(q.average_per_night, Decimal::new(10000, 2));
    }

    #[test]
    fn empty_table_quotes_zero() {
        let q = PricingTable::default().quote(1, 1, StayRange::new(d(2026, 1, 1), d(2026, 1, 3)));
        assert_eq!(q.total, Decimal::ZERO);
        assert_eq!(q.average_per_night, Decimal::ZERO);
        assert_eq!(q.nightly.len(), 2);
    }

    #[test]
    fn alternatives_span_three_days_each_side() {
        let alts = alternative_dates(d(2026, 8, 10), d(2026, 8, 1));
        assert_eq!(
            alts,
            vec![
                d(2026, 8, 7),
                d(2026, 8, 8),
                d(2026, 8, 9),
                d(2026, 8, 11),
                d(2026, 8, 12),
                d(2026, 8, 13),
            ]
        );
    }

    #[test]
    fn alternatives_skip_past_dates() {
        let alts = alternative_dates(d(2026, 8, 10), d(2026, 8, 9));
        assert_eq!(alts.first(), Some(&d(2026, 8, 9)));
        assert_eq!(alts.len(), 4);
    }
}
