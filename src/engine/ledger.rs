use std::collections::BTreeMap;

use chrono::NaiveDate;

use super::{Engine, EngineError};
use crate::limits::{MAX_BULK_DAYS, MAX_SESSION_ID_LEN, MAX_STAY_NIGHTS};
use crate::model::*;
use crate::observability;

// ── Planning ─────────────────────────────────────────────
//
// Pure functions over a locked partition. They never mutate; each returns
// the full rows a commit should write.

/// One unit per night of `stay`.
pub(super) fn nightly_need(stay: StayRange, count: u32) -> BTreeMap<NaiveDate, u32> {
    stay.dates().map(|date| (date, count)).collect()
}

/// Rows that would be created lazily for `dates`. Existing rows are skipped.
pub(super) fn plan_ensure(
    p: &LedgerPartition,
    dates: impl IntoIterator<Item = NaiveDate>,
) -> Vec<InventoryRow> {
    dates
        .into_iter()
        .filter(|date| !p.rows.contains_key(date))
        .map(|date| p.row_or_default(date))
        .collect()
}

/// All-or-nothing: fails on the first date without `need[date]` free units.
pub(super) fn plan_reserve(
    p: &LedgerPartition,
    need: &BTreeMap<NaiveDate, u32>,
) -> Result<Vec<InventoryRow>, EngineError> {
    let mut rows = Vec::with_capacity(need.len());
    for (&date, &count) in need {
        let mut row = p.row_or_default(date);
        if row.available() < count {
            metrics::counter!(observability::INVENTORY_CONFLICTS_TOTAL,
                "room_type" => p.room_type_id.to_string())
            .increment(1);
            return Err(EngineError::NoAvailability {
                room_type_id: p.room_type_id,
                date,
            });
        }
        row.tentative += count;
        rows.push(row);
    }
    Ok(rows)
}

/// Tentative → booked. A shortfall means the ledger and the holds disagree.
pub(super) fn plan_promote(
    p: &LedgerPartition,
    need: &BTreeMap<NaiveDate, u32>,
) -> Result<Vec<InventoryRow>, EngineError> {
    let mut rows = Vec::with_capacity(need.len());
    for (&date, &count) in need {
        let mut row = p.rows.get(&date).copied().ok_or_else(|| {
            EngineError::Inconsistent(format!(
                "no ledger row for room type {} on {date}",
                p.room_type_id
            ))
        })?;
        if row.tentative < count {
            return Err(EngineError::Inconsistent(format!(
                "room type {} on {date}: promoting {count} units but only {} tentative",
                p.room_type_id, row.tentative
            )));
        }
        row.tentative -= count;
        row.booked += count;
        rows.push(row);
    }
    Ok(rows)
}

/// Decrement `counter`, floored at zero. Dates without a row are skipped.
pub(super) fn plan_release(
    p: &LedgerPartition,
    need: &BTreeMap<NaiveDate, u32>,
    counter: Counter,
) -> Vec<InventoryRow> {
    need.iter()
        .filter_map(|(date, &count)| {
            let mut row = p.rows.get(date).copied()?;
            match counter {
                Counter::Tentative => row.tentative = row.tentative.saturating_sub(count),
                Counter::Booked => row.booked = row.booked.saturating_sub(count),
            }
            Some(row)
        })
        .collect()
}

/// Every date whose committed units exceed `allotment` is reported.
pub(super) fn plan_allotment(
    p: &LedgerPartition,
    dates: impl IntoIterator<Item = NaiveDate>,
    allotment: u32,
) -> Result<Vec<InventoryRow>, EngineError> {
    let mut rows = Vec::new();
    let mut violations = Vec::new();
    for date in dates {
        let mut row = p.row_or_default(date);
        if allotment < row.committed() {
            violations.push(super::AllotmentViolation {
                date,
                requested: i64::from(allotment),
                committed: row.committed(),
            });
            continue;
        }
        row.allotment = allotment;
        rows.push(row);
    }
    if violations.is_empty() {
        Ok(rows)
    } else {
        Err(EngineError::AllotmentBelowCommitted(violations))
    }
}

// ── Validation ───────────────────────────────────────────

pub(super) fn validate_stay(
    check_in: NaiveDate,
    check_out: NaiveDate,
    today: NaiveDate,
) -> Result<StayRange, EngineError> {
    let stay = StayRange::try_new(check_in, check_out).ok_or_else(|| {
        EngineError::Validation(format!(
            "check-out {check_out} must be after check-in {check_in}"
        ))
    })?;
    if check_in < today {
        return Err(EngineError::Validation(format!(
            "check-in {check_in} is in the past"
        )));
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay is too long"));
    }
    Ok(stay)
}

pub(super) fn validate_session(session_id: &str) -> Result<(), EngineError> {
    if session_id.is_empty() {
        return Err(EngineError::Validation("session id is required".into()));
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(EngineError::LimitExceeded("session id is too long"));
    }
    Ok(())
}

fn validate_allotment(allotment: i64) -> Result<u32, EngineError> {
    if allotment < 0 {
        return Err(EngineError::Validation(format!(
            "allotment {allotment} must not be negative"
        )));
    }
    u32::try_from(allotment)
        .map_err(|_| EngineError::Validation(format!("allotment {allotment} is too large")))
}

// ── Ledger operations ────────────────────────────────────

impl Engine {
    /// Create missing rows for every night of `stay` with the room type's
    /// default allotment. Returns how many rows were created.
    pub async fn ensure(&self, room_type_id: RoomTypeId, stay: StayRange) -> Result<usize, EngineError> {
        let handle = self
            .partition(room_type_id)
            .ok_or_else(|| EngineError::not_found("room type", room_type_id))?;
        // Fast path: nothing to write, no WAL round trip.
        if plan_ensure(&*handle.read().await, stay.dates()).is_empty() {
            return Ok(0);
        }

        let mut txn = self.begin().await;
        self.lock_partitions(&mut txn, [room_type_id]).await?;
        let rows = plan_ensure(txn.partition(room_type_id)?, stay.dates());
        let created = rows.len();
        if created > 0 {
            self.commit(&mut txn, vec![Event::InventoryWritten { room_type_id, rows }])
                .await?;
        }
        Ok(created)
    }

    pub async fn available(&self, room_type_id: RoomTypeId, date: NaiveDate) -> Result<u32, EngineError> {
        let handle = self
            .partition(room_type_id)
            .ok_or_else(|| EngineError::not_found("room type", room_type_id))?;
        let guard = handle.read().await;
        Ok(guard.available(date))
    }

    /// Reserve `count` tentative units on every night of `stay`, or nothing.
    pub async fn reserve_tentative(
        &self,
        room_type_id: RoomTypeId,
        stay: StayRange,
        count: u32,
    ) -> Result<(), EngineError> {
        if count == 0 {
            return Err(EngineError::Validation("count must be at least 1".into()));
        }
        let mut txn = self.begin().await;
        self.lock_partitions(&mut txn, [room_type_id]).await?;
        let rows = plan_reserve(txn.partition(room_type_id)?, &nightly_need(stay, count))?;
        self.commit(&mut txn, vec![Event::InventoryWritten { room_type_id, rows }])
            .await
    }

    pub async fn promote(
        &self,
        room_type_id: RoomTypeId,
        stay: StayRange,
        count: u32,
    ) -> Result<(), EngineError> {
        let mut txn = self.begin().await;
        self.lock_partitions(&mut txn, [room_type_id]).await?;
        let rows = plan_promote(txn.partition(room_type_id)?, &nightly_need(stay, count))?;
        self.commit(&mut txn, vec![Event::InventoryWritten { room_type_id, rows }])
            .await
    }

    pub async fn release(
        &self,
        room_type_id: RoomTypeId,
        stay: StayRange,
        from: Counter,
        count: u32,
    ) -> Result<(), EngineError> {
        let mut txn = self.begin().await;
        self.lock_partitions(&mut txn, [room_type_id]).await?;
        let rows = plan_release(txn.partition(room_type_id)?, &nightly_need(stay, count), from);
        if rows.is_empty() {
            return Ok(());
        }
        self.commit(&mut txn, vec![Event::InventoryWritten { room_type_id, rows }])
            .await
    }

    pub async fn set_allotment(
        &self,
        room_type_id: RoomTypeId,
        date: NaiveDate,
        allotment: i64,
    ) -> Result<InventoryRow, EngineError> {
        let allotment = validate_allotment(allotment)?;
        let mut txn = self.begin().await;
        self.lock_partitions(&mut txn, [room_type_id]).await?;
        let rows = plan_allotment(txn.partition(room_type_id)?, [date], allotment)?;
        let row = rows[0];
        self.commit(&mut txn, vec![Event::InventoryWritten { room_type_id, rows }])
            .await?;
        tracing::info!("room type {room_type_id} allotment on {date} set to {allotment}");
        Ok(row)
    }

    /// Set the allotment on every date of the inclusive range `[start, end]`.
    /// Rejected as a whole if any date would drop below its committed units.
    pub async fn bulk_set_allotment(
        &self,
        room_type_id: RoomTypeId,
        start: NaiveDate,
        end: NaiveDate,
        allotment: i64,
    ) -> Result<usize, EngineError> {
        if end < start {
            return Err(EngineError::Validation(format!(
                "range end {end} is before start {start}"
            )));
        }
        if (end - start).num_days() + 1 > MAX_BULK_DAYS {
            return Err(EngineError::LimitExceeded("bulk update range is too long"));
        }
        let allotment = validate_allotment(allotment)?;
        let dates = start.iter_days().take_while(move |d| *d <= end);

        let mut txn = self.begin().await;
        self.lock_partitions(&mut txn, [room_type_id]).await?;
        let rows = plan_allotment(txn.partition(room_type_id)?, dates, allotment)?;
        let updated = rows.len();
        self.commit(&mut txn, vec![Event::InventoryWritten { room_type_id, rows }])
            .await?;
        tracing::info!(
            "room type {room_type_id} allotment set to {allotment} on {updated} dates [{start}, {end}]"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    fn partition() -> LedgerPartition {
        let mut p = LedgerPartition::new(1, 2);
        let mut row = InventoryRow::new(1, d(2), 2);
        row.booked = 1;
        p.rows.insert(d(2), row);
        p
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        let p = partition();
        let ok = plan_reserve(&p, &nightly_need(StayRange::new(d(1), d(3)), 1)).unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[1].tentative, 1);
        assert_eq!(ok[1].booked, 1);

        let err = plan_reserve(&p, &nightly_need(StayRange::new(d(1), d(3)), 2)).unwrap_err();
        assert!(matches!(err, EngineError::NoAvailability { date, .. } if date == d(2)));
    }

    #[test]
    fn promote_requires_tentative_units() {
        let mut p = partition();
        let err = plan_promote(&p, &nightly_need(StayRange::new(d(2), d(3)), 1)).unwrap_err();
        assert!(matches!(err, EngineError::Inconsistent(_)));

        p.rows.get_mut(&d(2)).unwrap().tentative = 1;
        let rows = plan_promote(&p, &nightly_need(StayRange::new(d(2), d(3)), 1)).unwrap();
        assert_eq!((rows[0].booked, rows[0].tentative), (2, 0));
    }

    #[test]
    fn release_floors_at_zero() {
        let p = partition();
        let rows = plan_release(&p, &nightly_need(StayRange::new(d(1), d(3)), 5), Counter::Booked);
        // d(1) has no row and is skipped
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].booked, 0);
    }

    #[test]
    fn allotment_reports_every_violation() {
        let mut p = partition();
        let mut row = InventoryRow::new(1, d(4), 3);
        row.tentative = 2;
        p.rows.insert(d(4), row);

        let err = plan_allotment(&p, [d(2), d(3), d(4)], 0).unwrap_err();
        match err {
            EngineError::AllotmentBelowCommitted(v) => {
                let dates: Vec<_> = v.iter().map(|x| x.date).collect();
                assert_eq!(dates, vec![d(2), d(4)]);
                assert_eq!(v[1].committed, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(plan_allotment(&p, [d(2), d(3), d(4)], 2).unwrap().len(), 3);
    }

    #[test]
    fn ensure_skips_existing_rows() {
        let p = partition();
        let rows = plan_ensure(&p, [d(1), d(2), d(3)]);
        assert_eq!(rows.iter().map(|r| r.date).collect::<Vec<_>>(), vec![d(1), d(3)]);
        assert!(rows.iter().all(|r| r.allotment == 2 && r.committed() == 0));
    }

    #[test]
    fn stay_validation() {
        assert!(validate_stay(d(5), d(5), d(1)).is_err());
        assert!(validate_stay(d(1), d(3), d(2)).is_err());
        assert!(validate_stay(d(2), d(3), d(2)).is_ok());
        let far = d(1) + Duration::days(MAX_STAY_NIGHTS + 1);
        assert!(matches!(
            validate_stay(d(1), far, d(1)),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn session_validation() {
        assert!(validate_session("").is_err());
        assert!(validate_session(&"x".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
        assert!(validate_session("abc").is_ok());
    }
}
