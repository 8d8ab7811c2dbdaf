use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ulid::Ulid;

use super::holds::{count_by_date, release_holds};
use super::ledger::{plan_promote, plan_release, plan_reserve, validate_session, validate_stay};
use super::{Engine, EngineError, Txn};
use crate::limits::{MAX_DETAILS_PER_BOOKING, MAX_GUESTS_PER_DETAIL};
use crate::model::*;
use crate::observability;

/// One leg of a booking request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDetail {
    pub room_type_id: RoomTypeId,
    pub rate_plan_id: RatePlanId,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub num_guests: u32,
    #[serde(default)]
    pub guests: Vec<BookingGuest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBooking {
    pub guest_id: Option<GuestId>,
    /// Holds of this session are claimed before fresh units are reserved.
    pub session_id: Option<String>,
    pub voucher_code: Option<String>,
    pub details: Vec<NewDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub booking: Booking,
    /// `None` when the booking was still pending payment.
    pub refund_amount: Option<Decimal>,
}

/// Refund owed when cancelling on `today`.
///
/// Cancelling at least `days_before_check_in` whole days before the first
/// night refunds `refund_percentage` of the total; later cancellations refund
/// nothing.
pub fn refund_amount(
    policy: &PolicySnapshot,
    total_amount: Decimal,
    first_check_in: NaiveDate,
    today: NaiveDate,
) -> Decimal {
    let days_before = (first_check_in - today).num_days();
    if days_before >= i64::from(policy.days_before_check_in) {
        (total_amount * policy.refund_percentage / Decimal::ONE_HUNDRED).round_dp(2)
    } else {
        Decimal::ZERO
    }
}

fn normalize_guests(guests: &[BookingGuest]) -> Result<Vec<BookingGuest>, EngineError> {
    if guests.len() > MAX_GUESTS_PER_DETAIL {
        return Err(EngineError::LimitExceeded("too many guests on one booking detail"));
    }
    if guests.iter().any(|g| g.name.trim().is_empty()) {
        return Err(EngineError::Validation("guest name is required".into()));
    }
    let primaries = guests.iter().filter(|g| g.is_primary).count();
    if primaries > 1 {
        return Err(EngineError::Validation(
            "only one guest per detail can be primary".into(),
        ));
    }
    let mut guests = guests.to_vec();
    if primaries == 0 {
        if let Some(first) = guests.first_mut() {
            first.is_primary = true;
        }
    }
    Ok(guests)
}

fn transition(to: BookingStatus) {
    metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
}

impl Engine {
    /// Price, validate and persist a booking in `PendingPayment`.
    ///
    /// Every night is backed by a claimed hold: the session's live hold for
    /// that night if there is one, otherwise a freshly reserved tentative unit.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        if req.details.is_empty() {
            return Err(EngineError::Validation(
                "booking needs at least one detail".into(),
            ));
        }
        if req.details.len() > MAX_DETAILS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many booking details"));
        }
        if let Some(session_id) = &req.session_id {
            validate_session(session_id)?;
        }

        let today = self.clock.today();
        let booking_id = Ulid::new();
        let mut details = Vec::with_capacity(req.details.len());
        let mut subtotal = Decimal::ZERO;
        for d in &req.details {
            let room_type = self.catalog.room_type(d.room_type_id).ok_or_else(|| {
                EngineError::Validation(format!("unknown room type {}", d.room_type_id))
            })?;
            if self.catalog.rate_plan(d.rate_plan_id).is_none() {
                return Err(EngineError::Validation(format!(
                    "unknown rate plan {}",
                    d.rate_plan_id
                )));
            }
            let stay = validate_stay(d.check_in, d.check_out, today)?;
            if d.num_guests == 0 || d.num_guests > room_type.max_occupancy {
                return Err(EngineError::Validation(format!(
                    "{} takes 1 to {} guests, got {}",
                    room_type.name, room_type.max_occupancy, d.num_guests
                )));
            }
            let guests = normalize_guests(&d.guests)?;
            let quote = self.catalog.pricing.quote(d.room_type_id, d.rate_plan_id, stay);
            subtotal += quote.total;
            details.push(BookingDetail {
                id: Ulid::new(),
                booking_id,
                room_type_id: d.room_type_id,
                rate_plan_id: d.rate_plan_id,
                stay,
                num_guests: d.num_guests,
                guests,
                nightly_prices: quote.nightly,
            });
        }

        // The first leg's policy governs the whole booking.
        let policy = self
            .catalog
            .policy_for_rate_plan(req.details[0].rate_plan_id)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "rate plan {} has no cancellation policy",
                    req.details[0].rate_plan_id
                ))
            })?
            .snapshot();
        let discount = match &req.voucher_code {
            Some(code) => self.voucher_discount(code, subtotal, today)?,
            None => Decimal::ZERO,
        };
        let now = self.clock.now();
        let booking = Booking {
            id: booking_id,
            guest_id: req.guest_id,
            voucher_code: req.voucher_code.clone(),
            subtotal,
            discount,
            total_amount: (subtotal - discount).max(Decimal::ZERO),
            status: BookingStatus::PendingPayment,
            policy,
            details,
            refund_amount: None,
            created_at: now,
            updated_at: now,
        };

        let mut txn = self.begin().await;
        self.lock_partitions(&mut txn, booking.room_type_ids()).await?;
        let now = self.clock.now();
        let hold_owner = req
            .session_id
            .clone()
            .unwrap_or_else(|| booking_id.to_string());

        let mut commit = Vec::new();
        for (room_type_id, nights) in booking.nights_by_room_type() {
            let partition = txn.partition(room_type_id)?;
            let mut pool: BTreeMap<NaiveDate, Vec<HoldRow>> = BTreeMap::new();
            if let Some(session_id) = &req.session_id {
                for hold in partition.live_session_holds(session_id, now) {
                    pool.entry(hold.date).or_default().push(hold.clone());
                }
            }

            let mut claimed = Vec::new();
            let mut need = BTreeMap::new();
            for (date, count) in nights {
                let mut available = pool.remove(&date).unwrap_or_default();
                let take = available.len().min(count as usize);
                for mut hold in available.drain(..take) {
                    hold.booking_id = Some(booking_id);
                    claimed.push(hold);
                }
                let missing = count - take as u32;
                if missing > 0 {
                    need.insert(date, missing);
                }
            }

            let rows = plan_reserve(partition, &need)?;
            for (&date, &missing) in &need {
                claimed.extend((0..missing).map(|_| HoldRow {
                    id: Ulid::new(),
                    session_id: hold_owner.clone(),
                    guest_account_id: req.guest_id,
                    room_type_id,
                    date,
                    hold_expiry: now,
                    booking_id: Some(booking_id),
                }));
            }
            if !rows.is_empty() {
                commit.push(Event::InventoryWritten { room_type_id, rows });
            }
            commit.push(Event::HoldsWritten {
                room_type_id,
                holds: claimed,
            });
        }
        commit.push(Event::BookingCreated {
            booking: booking.clone(),
        });
        self.commit(&mut txn, commit).await?;
        drop(txn);

        transition(BookingStatus::PendingPayment);
        info!(
            "booking {booking_id} created: {} details, total {}",
            booking.details.len(),
            booking.total_amount
        );

        // Usage counting is best-effort and never undoes the booking.
        if let Some(code) = &booking.voucher_code {
            if let Err(e) = self.redeem_voucher(code).await {
                warn!("voucher {code} usage not recorded for booking {booking_id}: {e}");
            }
        }
        Ok(booking)
    }

    fn voucher_discount(
        &self,
        code: &str,
        subtotal: Decimal,
        today: NaiveDate,
    ) -> Result<Decimal, EngineError> {
        let voucher = self
            .catalog
            .voucher(code)
            .ok_or_else(|| EngineError::Validation(format!("unknown voucher {code}")))?;
        if !voucher.is_valid_on(today) {
            return Err(EngineError::Validation(format!(
                "voucher {code} is not valid on {today}"
            )));
        }
        if voucher.is_exhausted(self.voucher_used(code)) {
            return Err(EngineError::Validation(format!(
                "voucher {code} has no uses left"
            )));
        }
        Ok(voucher.discount(subtotal))
    }

    /// Bump the usage count of `code` in its own commit.
    pub async fn redeem_voucher(&self, code: &str) -> Result<u32, EngineError> {
        let _serial = self.voucher_lock.lock().await;
        // Concurrent bookings all pass the unlocked pricing check; this one is serialized.
        let used = self.voucher_used(code);
        if let Some(voucher) = self.catalog.voucher(code) {
            if voucher.is_exhausted(used) {
                return Err(EngineError::Validation(format!(
                    "voucher {code} has no uses left"
                )));
            }
        }
        let mut txn = self.begin().await;
        let used_count = used + 1;
        self.commit(
            &mut txn,
            vec![Event::VoucherUsed {
                code: code.to_string(),
                used_count,
            }],
        )
        .await?;
        Ok(used_count)
    }

    /// PendingPayment → Confirmed.
    ///
    /// One commit promotes every claimed night from tentative to booked,
    /// deletes the claimed holds and writes the nightly log.
    pub async fn confirm_booking(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let mut txn = self.begin().await;
        self.lock_booking(&mut txn, booking_id).await?;
        let booking = txn.booking()?.booking.clone();
        if booking.status != BookingStatus::PendingPayment {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                action: "confirm",
            });
        }
        self.lock_partitions(&mut txn, booking.room_type_ids()).await?;
        let now = self.clock.now();

        let mut commit = Vec::new();
        for (room_type_id, nights) in booking.nights_by_room_type() {
            let partition = txn.partition(room_type_id)?;
            let claimed: Vec<&HoldRow> = partition.holds_of_booking(booking_id).collect();
            if count_by_date(claimed.iter().copied()) != nights {
                return Err(EngineError::Inconsistent(format!(
                    "booking {booking_id} holds {} nights of room type {room_type_id}, expected {}",
                    claimed.len(),
                    nights.values().sum::<u32>()
                )));
            }
            let rows = plan_promote(partition, &nights)?;
            commit.push(Event::InventoryWritten { room_type_id, rows });
            commit.push(Event::HoldsRemoved {
                room_type_id,
                ids: claimed.iter().map(|h| h.id).collect(),
            });
        }

        let entries = booking
            .details
            .iter()
            .flat_map(|detail| {
                detail.nightly_prices.iter().map(move |night| NightlyLogEntry {
                    id: Ulid::new(),
                    booking_id,
                    booking_detail_id: detail.id,
                    date: night.date,
                    price: night.price,
                    logged_at: now,
                })
            })
            .collect();
        commit.push(Event::NightlyLogged {
            booking_id,
            entries,
        });
        commit.push(Event::BookingStatusChanged {
            booking_id,
            status: BookingStatus::Confirmed,
            at: now,
            refund_amount: None,
        });
        self.commit(&mut txn, commit).await?;

        transition(BookingStatus::Confirmed);
        info!("booking {booking_id} confirmed");
        Ok(txn.booking()?.booking.clone())
    }

    /// Cancel from PendingPayment, Confirmed or CheckedIn.
    ///
    /// `requester` is the guest asking; `None` is a staff cancellation.
    pub async fn cancel_booking(
        &self,
        booking_id: BookingId,
        requester: Option<GuestId>,
    ) -> Result<Cancellation, EngineError> {
        let mut txn = self.begin().await;
        self.lock_booking(&mut txn, booking_id).await?;
        let record = txn.booking()?;
        let booking = record.booking.clone();
        let active: Vec<RoomAssignment> = record.active_assignments().cloned().collect();
        if let Some(guest_id) = requester {
            if booking.guest_id != Some(guest_id) {
                return Err(EngineError::Unauthorized(booking_id));
            }
        }

        let now = self.clock.now();
        let mut commit = Vec::new();
        let refund = match booking.status {
            BookingStatus::PendingPayment => {
                self.lock_partitions(&mut txn, booking.room_type_ids()).await?;
                commit.extend(release_claimed(&txn, &booking)?);
                None
            }
            BookingStatus::Confirmed | BookingStatus::CheckedIn => {
                self.lock_partitions(&mut txn, booking.room_type_ids()).await?;
                commit.extend(release_booked(&txn, &booking)?);
                self.lock_rooms(&mut txn, active.iter().map(|a| a.room_id)).await?;
                commit.extend(end_assignments(&active, now));
                let today = self.clock.today();
                let first = booking.first_check_in().unwrap_or(today);
                Some(refund_amount(&booking.policy, booking.total_amount, first, today))
            }
            from => {
                return Err(EngineError::InvalidTransition {
                    from,
                    action: "cancel",
                });
            }
        };
        commit.push(Event::BookingStatusChanged {
            booking_id,
            status: BookingStatus::Cancelled,
            at: now,
            refund_amount: refund,
        });
        self.commit(&mut txn, commit).await?;

        transition(BookingStatus::Cancelled);
        match refund {
            Some(amount) => info!("booking {booking_id} cancelled, refund {amount}"),
            None => info!("booking {booking_id} cancelled before payment"),
        }
        Ok(Cancellation {
            booking: txn.booking()?.booking.clone(),
            refund_amount: refund,
        })
    }

    /// Confirmed → NoShow once the first check-in date has passed.
    /// The booked units are released; nothing is refunded.
    pub async fn mark_no_show(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let mut txn = self.begin().await;
        self.lock_booking(&mut txn, booking_id).await?;
        let booking = txn.booking()?.booking.clone();
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                action: "mark no-show",
            });
        }
        let today = self.clock.today();
        if let Some(first) = booking.first_check_in() {
            if today <= first {
                return Err(EngineError::Validation(format!(
                    "no-show can only be recorded after the check-in date {first}"
                )));
            }
        }

        self.lock_partitions(&mut txn, booking.room_type_ids()).await?;
        let mut commit = release_booked(&txn, &booking)?;
        commit.push(Event::BookingStatusChanged {
            booking_id,
            status: BookingStatus::NoShow,
            at: self.clock.now(),
            refund_amount: None,
        });
        self.commit(&mut txn, commit).await?;

        transition(BookingStatus::NoShow);
        info!("booking {booking_id} marked no-show");
        Ok(txn.booking()?.booking.clone())
    }
}

/// Give back the tentative units a pending booking claimed.
fn release_claimed(txn: &Txn<'_>, booking: &Booking) -> Result<Vec<Event>, EngineError> {
    let mut events = Vec::new();
    for room_type_id in booking.room_type_ids() {
        let partition = txn.partition(room_type_id)?;
        let claimed: Vec<&HoldRow> = partition.holds_of_booking(booking.id).collect();
        events.extend(release_holds(partition, room_type_id, &claimed));
    }
    Ok(events)
}

fn release_booked(txn: &Txn<'_>, booking: &Booking) -> Result<Vec<Event>, EngineError> {
    let mut events = Vec::new();
    for (room_type_id, nights) in booking.nights_by_room_type() {
        let rows = plan_release(txn.partition(room_type_id)?, &nights, Counter::Booked);
        if !rows.is_empty() {
            events.push(Event::InventoryWritten { room_type_id, rows });
        }
    }
    Ok(events)
}

/// Close assignments and leave their rooms vacant and dirty.
pub(super) fn end_assignments(
    assignments: &[RoomAssignment],
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<Event> {
    assignments
        .iter()
        .flat_map(|a| {
            [
                Event::AssignmentEnded {
                    assignment_id: a.id,
                    booking_id: a.booking_id,
                    room_id: a.room_id,
                    ended_at: now,
                },
                Event::RoomUpdated {
                    room_id: a.room_id,
                    occupancy: OccupancyStatus::Vacant,
                    housekeeping: HousekeepingStatus::Dirty,
                },
            ]
        })
        .collect()
}
