use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info};
use ulid::Ulid;

use super::ledger::{plan_release, plan_reserve, validate_session, validate_stay};
use super::{Engine, EngineError};
use crate::model::*;
use crate::observability;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldReceipt {
    pub hold_expiry: DateTime<Utc>,
    /// One row per night, ordered by date.
    pub holds: Vec<HoldRow>,
    /// Nights that reused a live hold of the same session.
    pub extended: usize,
}

impl Engine {
    /// Reserve one tentative unit per night for `session_id`.
    ///
    /// Nights the session already holds (live, unclaimed) are extended to the
    /// new expiry instead of reserving a second unit. All nights succeed or
    /// none do.
    pub async fn create_hold(
        &self,
        session_id: &str,
        guest_account_id: Option<GuestId>,
        room_type_id: RoomTypeId,
        check_in: NaiveDate,
        check_out: NaiveDate,
        ttl: Duration,
    ) -> Result<HoldReceipt, EngineError> {
        validate_session(session_id)?;
        let stay = validate_stay(check_in, check_out, self.clock.today())?;
        if self.catalog.room_type(room_type_id).is_none() {
            return Err(EngineError::Validation(format!(
                "unknown room type {room_type_id}"
            )));
        }

        let mut txn = self.begin().await;
        self.lock_partitions(&mut txn, [room_type_id]).await?;
        let now = self.clock.now();
        let hold_expiry = now + ttl;
        let partition = txn.partition(room_type_id)?;

        let mut existing: BTreeMap<NaiveDate, HoldRow> = BTreeMap::new();
        for hold in partition.live_session_holds(session_id, now) {
            if stay.contains(hold.date) {
                existing.entry(hold.date).or_insert_with(|| hold.clone());
            }
        }
        let need: BTreeMap<NaiveDate, u32> = stay
            .dates()
            .filter(|date| !existing.contains_key(date))
            .map(|date| (date, 1))
            .collect();

        let rows = match plan_reserve(partition, &need) {
            Ok(rows) => rows,
            Err(e) => {
                metrics::counter!(observability::HOLDS_TOTAL, "outcome" => "rejected").increment(1);
                debug!("hold for session {session_id} rejected: {e}");
                return Err(e);
            }
        };

        let extended = existing.len();
        let holds: Vec<HoldRow> = stay
            .dates()
            .map(|date| match existing.remove(&date) {
                Some(mut hold) => {
                    hold.hold_expiry = hold_expiry;
                    if guest_account_id.is_some() {
                        hold.guest_account_id = guest_account_id;
                    }
                    hold
                }
                None => HoldRow {
                    id: Ulid::new(),
                    session_id: session_id.to_string(),
                    guest_account_id,
                    room_type_id,
                    date,
                    hold_expiry,
                    booking_id: None,
                },
            })
            .collect();

        let mut commit = Vec::with_capacity(2);
        if !rows.is_empty() {
            commit.push(Event::InventoryWritten { room_type_id, rows });
        }
        commit.push(Event::HoldsWritten {
            room_type_id,
            holds: holds.clone(),
        });
        self.commit(&mut txn, commit).await?;

        let outcome = if extended > 0 { "extended" } else { "created" };
        metrics::counter!(observability::HOLDS_TOTAL, "outcome" => outcome).increment(1);
        info!(
            "hold {outcome} for session {session_id}: room type {room_type_id} {stay} until {hold_expiry}"
        );
        Ok(HoldReceipt {
            hold_expiry,
            holds,
            extended,
        })
    }

    /// Drop every unclaimed hold of a session and give its units back.
    pub async fn release_session_holds(&self, session_id: &str) -> Result<usize, EngineError> {
        validate_session(session_id)?;
        let mut txn = self.begin().await;
        let ids: Vec<RoomTypeId> = self.ledger.iter().map(|e| *e.key()).collect();
        self.lock_partitions(&mut txn, ids).await?;

        let mut commit = Vec::new();
        let mut released = 0;
        for (&room_type_id, partition) in &txn.partitions {
            let holds: Vec<&HoldRow> = partition
                .holds
                .values()
                .filter(|h| h.session_id == session_id && !h.is_claimed())
                .collect();
            released += holds.len();
            commit.extend(release_holds(partition, room_type_id, &holds));
        }
        self.commit(&mut txn, commit).await?;
        if released > 0 {
            info!("released {released} holds of session {session_id}");
        }
        Ok(released)
    }
}

/// Events that delete `holds` and give their tentative units back.
pub(super) fn release_holds(
    partition: &LedgerPartition,
    room_type_id: RoomTypeId,
    holds: &[&HoldRow],
) -> Vec<Event> {
    if holds.is_empty() {
        return Vec::new();
    }
    let rows = plan_release(partition, &count_by_date(holds.iter().copied()), Counter::Tentative);
    vec![
        Event::InventoryWritten { room_type_id, rows },
        Event::HoldsRemoved {
            room_type_id,
            ids: holds.iter().map(|h| h.id).collect(),
        },
    ]
}

pub(super) fn count_by_date<'a>(holds: impl IntoIterator<Item = &'a HoldRow>) -> BTreeMap<NaiveDate, u32> {
    let mut counts = BTreeMap::new();
    for hold in holds {
        *counts.entry(hold.date).or_insert(0) += 1;
    }
    counts
}
