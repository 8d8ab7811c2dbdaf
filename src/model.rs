use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type RoomTypeId = u32;
pub type RoomId = u32;
pub type RatePlanId = u32;
pub type PolicyId = u32;
pub type GuestId = u64;
pub type BookingId = Ulid;

/// Half-open stay `[check_in, check_out)`. Each date in the range is one night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StayRange {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl StayRange {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "StayRange check_in must be before check_out");
        Self {
            check_in,
            check_out,
        }
    }

    /// Returns `None` unless `check_out > check_in`.
    pub fn try_new(check_in: NaiveDate, check_out: NaiveDate) -> Option<Self> {
        (check_out > check_in).then_some(Self {
            check_in,
            check_out,
        })
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let (start, end) = (self.check_in, self.check_out);
        start.iter_days().take_while(move |d| *d < end)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.check_in <= date && date < self.check_out
    }
}

impl fmt::Display for StayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

// ── Inventory ledger ─────────────────────────────────────────────

/// One ledger row per (room type, date).
/// Invariant: `booked + tentative <= allotment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRow {
    pub room_type_id: RoomTypeId,
    pub date: NaiveDate,
    pub allotment: u32,
    pub booked: u32,
    pub tentative: u32,
}

impl InventoryRow {
    pub fn new(room_type_id: RoomTypeId, date: NaiveDate, allotment: u32) -> Self {
        Self {
            room_type_id,
            date,
            allotment,
            booked: 0,
            tentative: 0,
        }
    }

    pub fn committed(&self) -> u32 {
        self.booked + self.tentative
    }

    pub fn available(&self) -> u32 {
        self.allotment.saturating_sub(self.committed())
    }
}

/// Which counter a release decrements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Tentative,
    Booked,
}

/// A tentative unit of one room type on one night.
///
/// Unclaimed holds belong to a session and expire; claimed holds belong to a
/// `PendingPayment` booking and are consumed on confirm or cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldRow {
    pub id: Ulid,
    pub session_id: String,
    pub guest_account_id: Option<GuestId>,
    pub room_type_id: RoomTypeId,
    pub date: NaiveDate,
    pub hold_expiry: DateTime<Utc>,
    pub booking_id: Option<BookingId>,
}

impl HoldRow {
    pub fn is_claimed(&self) -> bool {
        self.booking_id.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.hold_expiry < now
    }

    /// An unclaimed hold that has not expired yet.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_claimed() && !self.is_expired(now)
    }
}

/// All ledger rows and holds of one room type. The unit of locking.
#[derive(Debug, Clone)]
pub struct LedgerPartition {
    pub room_type_id: RoomTypeId,
    pub default_allotment: u32,
    pub rows: BTreeMap<NaiveDate, InventoryRow>,
    pub holds: HashMap<Ulid, HoldRow>,
}

impl LedgerPartition {
    pub fn new(room_type_id: RoomTypeId, default_allotment: u32) -> Self {
        Self {
            room_type_id,
            default_allotment,
            rows: BTreeMap::new(),
            holds: HashMap::new(),
        }
    }

    /// Row for `date`, or the row that would be created lazily.
    pub fn row_or_default(&self, date: NaiveDate) -> InventoryRow {
        self.rows
            .get(&date)
            .copied()
            .unwrap_or_else(|| InventoryRow::new(self.room_type_id, date, self.default_allotment))
    }

    pub fn available(&self, date: NaiveDate) -> u32 {
        self.row_or_default(date).available()
    }

    pub fn holds_of_booking(&self, booking_id: BookingId) -> impl Iterator<Item = &HoldRow> {
        self.holds
            .values()
            .filter(move |h| h.booking_id == Some(booking_id))
    }

    pub fn live_session_holds<'a>(
        &'a self,
        session_id: &'a str,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a HoldRow> + 'a {
        self.holds
            .values()
            .filter(move |h| h.session_id == session_id && h.is_live(now))
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::InventoryWritten { rows, .. } => {
                for row in rows {
                    self.rows.insert(row.date, *row);
                }
            }
            Event::HoldsWritten { holds, .. } => {
                for hold in holds {
                    self.holds.insert(hold.id, hold.clone());
                }
            }
            Event::HoldsRemoved { ids, .. } => {
                for id in ids {
                    self.holds.remove(id);
                }
            }
            _ => {}
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    PendingPayment,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::PendingPayment => "PendingPayment",
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::CheckedIn => "CheckedIn",
            BookingStatus::Completed => "Completed",
            BookingStatus::Cancelled => "Cancelled",
            BookingStatus::NoShow => "NoShow",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancellation terms copied onto the booking when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub name: String,
    pub description: String,
    pub days_before_check_in: u32,
    pub refund_percentage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingGuest {
    pub name: String,
    pub email: Option<String>,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightlyPrice {
    pub date: NaiveDate,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetail {
    pub id: Ulid,
    pub booking_id: BookingId,
    pub room_type_id: RoomTypeId,
    pub rate_plan_id: RatePlanId,
    pub stay: StayRange,
    pub num_guests: u32,
    pub guests: Vec<BookingGuest>,
    /// Quoted at creation; written to the nightly log on confirmation.
    pub nightly_prices: Vec<NightlyPrice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub guest_id: Option<GuestId>,
    pub voucher_code: Option<String>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total_amount: Decimal,
    pub status: BookingStatus,
    pub policy: PolicySnapshot,
    pub details: Vec<BookingDetail>,
    pub refund_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn first_check_in(&self) -> Option<NaiveDate> {
        self.details.iter().map(|d| d.stay.check_in).min()
    }

    pub fn detail(&self, detail_id: Ulid) -> Option<&BookingDetail> {
        self.details.iter().find(|d| d.id == detail_id)
    }

    /// Room type ids touched by this booking, ascending and deduplicated.
    pub fn room_type_ids(&self) -> Vec<RoomTypeId> {
        let mut ids: Vec<RoomTypeId> = self.details.iter().map(|d| d.room_type_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Number of nights per (room type, date) across all details.
    pub fn nights_by_room_type(&self) -> BTreeMap<RoomTypeId, BTreeMap<NaiveDate, u32>> {
        let mut out: BTreeMap<RoomTypeId, BTreeMap<NaiveDate, u32>> = BTreeMap::new();
        for detail in &self.details {
            let per_date = out.entry(detail.room_type_id).or_default();
            for date in detail.stay.dates() {
                *per_date.entry(date).or_default() += 1;
            }
        }
        out
    }
}

/// The authoritative revenue record: one row per (detail, night), written at confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightlyLogEntry {
    pub id: Ulid,
    pub booking_id: BookingId,
    pub booking_detail_id: Ulid,
    pub date: NaiveDate,
    pub price: Decimal,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentStatus {
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAssignment {
    pub id: Ulid,
    pub booking_id: BookingId,
    pub booking_detail_id: Ulid,
    pub room_id: RoomId,
    pub checked_in_at: DateTime<Utc>,
    pub checked_out_at: Option<DateTime<Utc>>,
    pub status: AssignmentStatus,
}

/// A booking plus everything hanging off it. Locked as one unit.
#[derive(Debug, Clone)]
pub struct BookingRecord {
    pub booking: Booking,
    pub nightly_log: Vec<NightlyLogEntry>,
    pub assignments: Vec<RoomAssignment>,
}

impl BookingRecord {
    pub fn new(booking: Booking) -> Self {
        Self {
            booking,
            nightly_log: Vec::new(),
            assignments: Vec::new(),
        }
    }

    pub fn active_assignment_for_detail(&self, detail_id: Ulid) -> Option<&RoomAssignment> {
        self.assignments
            .iter()
            .find(|a| a.booking_detail_id == detail_id && a.status == AssignmentStatus::Active)
    }

    pub fn active_assignments(&self) -> impl Iterator<Item = &RoomAssignment> {
        self.assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Active)
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                self.booking = booking.clone();
            }
            Event::BookingStatusChanged {
                status,
                at,
                refund_amount,
                ..
            } => {
                self.booking.status = *status;
                self.booking.updated_at = *at;
                if refund_amount.is_some() {
                    self.booking.refund_amount = *refund_amount;
                }
            }
            Event::NightlyLogged { entries, .. } => {
                self.nightly_log.extend(entries.iter().cloned());
            }
            Event::AssignmentOpened { assignment } => {
                self.assignments.retain(|a| a.id != assignment.id);
                self.assignments.push(assignment.clone());
            }
            Event::AssignmentEnded {
                assignment_id,
                ended_at,
                ..
            } => {
                if let Some(a) = self.assignments.iter_mut().find(|a| a.id == *assignment_id) {
                    a.status = AssignmentStatus::Ended;
                    a.checked_out_at = Some(*ended_at);
                }
            }
            _ => {}
        }
    }
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OccupancyStatus {
    Vacant,
    Occupied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HousekeepingStatus {
    Dirty,
    Cleaning,
    Clean,
    Inspected,
    MaintenanceRequired,
    OutOfService,
}

impl HousekeepingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HousekeepingStatus::Dirty => "Dirty",
            HousekeepingStatus::Cleaning => "Cleaning",
            HousekeepingStatus::Clean => "Clean",
            HousekeepingStatus::Inspected => "Inspected",
            HousekeepingStatus::MaintenanceRequired => "MaintenanceRequired",
            HousekeepingStatus::OutOfService => "OutOfService",
        }
    }

    /// Ready to receive a guest.
    pub fn is_sellable(self) -> bool {
        matches!(self, HousekeepingStatus::Clean | HousekeepingStatus::Inspected)
    }
}

impl fmt::Display for HousekeepingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub id: RoomId,
    pub number: String,
    pub room_type_id: RoomTypeId,
    pub occupancy: OccupancyStatus,
    pub housekeeping: HousekeepingStatus,
}

impl RoomState {
    pub fn new(id: RoomId, number: String, room_type_id: RoomTypeId) -> Self {
        Self {
            id,
            number,
            room_type_id,
            occupancy: OccupancyStatus::Vacant,
            housekeeping: HousekeepingStatus::Clean,
        }
    }

    pub fn apply(&mut self, event: &Event) {
        if let Event::RoomUpdated {
            occupancy,
            housekeeping,
            ..
        } = event
        {
            self.occupancy = *occupancy;
            self.housekeeping = *housekeeping;
        }
    }
}

// ── Events ───────────────────────────────────────────────────────

/// State-carrying domain events. A commit is an ordered list of these and is
/// the WAL record format; replaying a commit twice yields the same state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    InventoryWritten {
        room_type_id: RoomTypeId,
        rows: Vec<InventoryRow>,
    },
    HoldsWritten {
        room_type_id: RoomTypeId,
        holds: Vec<HoldRow>,
    },
    HoldsRemoved {
        room_type_id: RoomTypeId,
        ids: Vec<Ulid>,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        booking_id: BookingId,
        status: BookingStatus,
        at: DateTime<Utc>,
        refund_amount: Option<Decimal>,
    },
    NightlyLogged {
        booking_id: BookingId,
        entries: Vec<NightlyLogEntry>,
    },
    RoomUpdated {
        room_id: RoomId,
        occupancy: OccupancyStatus,
        housekeeping: HousekeepingStatus,
    },
    AssignmentOpened {
        assignment: RoomAssignment,
    },
    AssignmentEnded {
        assignment_id: Ulid,
        booking_id: BookingId,
        room_id: RoomId,
        ended_at: DateTime<Utc>,
    },
    VoucherUsed {
        code: String,
        used_count: u32,
    },
}

/// Where an event lands in engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget<'a> {
    Partition(RoomTypeId),
    Booking(BookingId),
    Room(RoomId),
    Voucher(&'a str),
}

impl Event {
    pub fn target(&self) -> EventTarget<'_> {
        match self {
            Event::InventoryWritten { room_type_id, .. }
            | Event::HoldsWritten { room_type_id, .. }
            | Event::HoldsRemoved { room_type_id, .. } => EventTarget::Partition(*room_type_id),
            Event::BookingCreated { booking } => EventTarget::Booking(booking.id),
            Event::BookingStatusChanged { booking_id, .. }
            | Event::NightlyLogged { booking_id, .. }
            | Event::AssignmentEnded { booking_id, .. } => EventTarget::Booking(*booking_id),
            Event::AssignmentOpened { assignment } => EventTarget::Booking(assignment.booking_id),
            Event::RoomUpdated { room_id, .. } => EventTarget::Room(*room_id),
            Event::VoucherUsed { code, .. } => EventTarget::Voucher(code),
        }
    }
}

/// One WAL record: every event of a single transaction.
pub type Commit = Vec<Event>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn stay_range_nights_and_dates() {
        let stay = StayRange::new(d(2026, 5, 30), d(2026, 6, 2));
        assert_eq!(stay.nights(), 3);
        let dates: Vec<_> = stay.dates().collect();
        assert_eq!(dates, vec![d(2026, 5, 30), d(2026, 5, 31), d(2026, 6, 1)]);
        assert!(stay.contains(d(2026, 6, 1)));
        assert!(!stay.contains(d(2026, 6, 2))); // half-open
    }

    #[test]
    fn stay_range_rejects_inverted() {
        assert!(StayRange::try_new(d(2026, 5, 2), d(2026, 5, 2)).is_none());
        assert!(StayRange::try_new(d(2026, 5, 3), d(2026, 5, 2)).is_none());
        assert!(StayRange::try_new(d(2026, 5, 2), d(2026, 5, 3)).is_some());
    }

    #[test]
    fn inventory_row_available_never_underflows() {
        let mut row = InventoryRow::new(1, d(2026, 1, 1), 2);
        row.booked = 2;
        row.tentative = 1;
        assert_eq!(row.available(), 0);
        assert_eq!(row.committed(), 3);
    }

    #[test]
    fn partition_lazy_row_uses_default_allotment() {
        let p = LedgerPartition::new(7, 5);
        let row = p.row_or_default(d(2026, 2, 1));
        assert_eq!(row.allotment, 5);
        assert_eq!(row.room_type_id, 7);
        assert!(p.rows.is_empty());
    }

    #[test]
    fn partition_apply_holds_upsert_and_remove() {
        let mut p = LedgerPartition::new(1, 3);
        let expiry = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let hold = HoldRow {
            id: Ulid::new(),
            session_id: "s1".into(),
            guest_account_id: None,
            room_type_id: 1,
            date: d(2026, 1, 2),
            hold_expiry: expiry,
            booking_id: None,
        };
        p.apply(&Event::HoldsWritten {
            room_type_id: 1,
            holds: vec![hold.clone()],
        });
        assert_eq!(p.holds.len(), 1);

        let mut extended = hold.clone();
        extended.hold_expiry = expiry + Duration::days(1);
        p.apply(&Event::HoldsWritten {
            room_type_id: 1,
            holds: vec![extended],
        });
        assert_eq!(p.holds.len(), 1);
        assert_eq!(p.holds[&hold.id].hold_expiry, expiry + Duration::days(1));

        p.apply(&Event::HoldsRemoved {
            room_type_id: 1,
            ids: vec![hold.id],
        });
        assert!(p.holds.is_empty());
    }

    #[test]
    fn hold_liveness() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let mut hold = HoldRow {
            id: Ulid::new(),
            session_id: "s".into(),
            guest_account_id: None,
            room_type_id: 1,
            date: d(2026, 1, 2),
            hold_expiry: now,
            booking_id: None,
        };
        // expiry is strict: a hold expiring exactly now is still live
        assert!(!hold.is_expired(now));
        assert!(hold.is_live(now));
        assert!(hold.is_expired(now + Duration::seconds(1)));

        hold.booking_id = Some(Ulid::new());
        assert!(!hold.is_live(now));
    }

    #[test]
    fn booking_nights_by_room_type_counts_overlaps() {
        let id = Ulid::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let detail = |rt: RoomTypeId, ci: NaiveDate, co: NaiveDate| BookingDetail {
            id: Ulid::new(),
            booking_id: id,
            room_type_id: rt,
            rate_plan_id: 1,
            stay: StayRange::new(ci, co),
            num_guests: 1,
            guests: vec![],
            nightly_prices: vec![],
        };
        let booking = Booking {
            id,
            guest_id: None,
            voucher_code: None,
            subtotal: Decimal::ZERO,
            discount: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            status: BookingStatus::PendingPayment,
            policy: PolicySnapshot {
                name: "flex".into(),
                description: String::new(),
                days_before_check_in: 1,
                refund_percentage: Decimal::ONE_HUNDRED,
            },
            details: vec![
                detail(2, d(2026, 3, 1), d(2026, 3, 3)),
                detail(2, d(2026, 3, 2), d(2026, 3, 4)),
                detail(1, d(2026, 3, 1), d(2026, 3, 2)),
            ],
            refund_amount: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(booking.room_type_ids(), vec![1, 2]);
        assert_eq!(booking.first_check_in(), Some(d(2026, 3, 1)));
        let nights = booking.nights_by_room_type();
        assert_eq!(nights[&2][&d(2026, 3, 2)], 2);
        assert_eq!(nights[&2][&d(2026, 3, 1)], 1);
        assert_eq!(nights[&1].len(), 1);
    }

    #[test]
    fn booking_record_assignment_lifecycle() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let booking_id = Ulid::new();
        let detail_id = Ulid::new();
        let mut record = BookingRecord::new(Booking {
            id: booking_id,
            guest_id: Some(9),
            voucher_code: None,
            subtotal: Decimal::ZERO,
            discount: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            status: BookingStatus::Confirmed,
            policy: PolicySnapshot {
                name: "n".into(),
                description: String::new(),
                days_before_check_in: 0,
                refund_percentage: Decimal::ZERO,
            },
            details: vec![],
            refund_amount: None,
            created_at: now,
            updated_at: now,
        });
        let assignment = RoomAssignment {
            id: Ulid::new(),
            booking_id,
            booking_detail_id: detail_id,
            room_id: 101,
            checked_in_at: now,
            checked_out_at: None,
            status: AssignmentStatus::Active,
        };
        record.apply(&Event::AssignmentOpened {
            assignment: assignment.clone(),
        });
        assert!(record.active_assignment_for_detail(detail_id).is_some());

        record.apply(&Event::AssignmentEnded {
            assignment_id: assignment.id,
            booking_id,
            room_id: 101,
            ended_at: now + Duration::days(2),
        });
        assert!(record.active_assignment_for_detail(detail_id).is_none());
        assert_eq!(record.assignments[0].checked_out_at, Some(now + Duration::days(2)));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::InventoryWritten {
            room_type_id: 3,
            rows: vec![InventoryRow::new(3, d(2026, 4, 1), 10)],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
