//! Request/response contracts of the core operations.
//!
//! Transport is somebody else's job: these types serialize with serde and the
//! service never returns `Err` for a rejected request. Callers check
//! `success`.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use ulid::Ulid;

use crate::engine::{
    Engine, EngineError, ErrorClass, NewBooking, NewDetail, RoomOffer, SearchQuery,
};
use crate::model::*;
use crate::observability;
use crate::sweeper::{HoldCleanupJob, NightAuditJob, RunRecord, SweepStatus, Sweeper};

const INTERNAL_ERROR: &str = "internal error";

// ── Requests ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateHoldRequest {
    pub session_id: String,
    pub room_type_id: RoomTypeId,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    #[serde(default)]
    pub guest_account_id: Option<GuestId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBookingRequest {
    pub guest_id: Option<GuestId>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub voucher_code: Option<String>,
    pub details: Vec<NewDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelBookingRequest {
    pub booking_id: BookingId,
    /// Absent for staff cancellations.
    #[serde(default)]
    pub guest_id: Option<GuestId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInRequest {
    pub booking_detail_id: Ulid,
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRoomRequest {
    pub assignment_id: Ulid,
    pub new_room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInventoryRequest {
    pub room_type_id: RoomTypeId,
    pub date: NaiveDate,
    pub allotment: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUpdateInventoryRequest {
    pub room_type_id: RoomTypeId,
    /// Inclusive.
    pub start_date: NaiveDate,
    /// Inclusive.
    pub end_date: NaiveDate,
    pub allotment: i64,
}

// ── Responses ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldResponse {
    pub success: bool,
    pub message: String,
    pub hold_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBookingResponse {
    pub success: bool,
    pub message: String,
    pub booking_id: Option<BookingId>,
    pub total_amount: Option<Decimal>,
    pub status: Option<BookingStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelBookingResponse {
    pub success: bool,
    pub message: String,
    pub refund_amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInResponse {
    pub success: bool,
    pub message: String,
    pub room_number: Option<String>,
    pub assignment_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutResponse {
    pub success: bool,
    pub message: String,
    pub total_amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRoomResponse {
    pub success: bool,
    pub message: String,
    pub new_room_number: Option<String>,
    pub assignment_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryError {
    pub date: Option<NaiveDate>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryResponse {
    pub success: bool,
    pub message: String,
    pub updated: usize,
    /// One entry per conflicting date on rejection.
    pub errors: Vec<InventoryError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomResponse {
    pub success: bool,
    pub message: String,
    pub housekeeping_status: Option<HousekeepingStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferView {
    pub room_type_id: RoomTypeId,
    pub room_type_name: String,
    pub max_occupancy: u32,
    pub available_units: u32,
    pub rate_plan_id: RatePlanId,
    pub rate_plan_name: String,
    pub nightly_prices: Vec<NightlyPrice>,
    pub total_price: Decimal,
    pub average_per_night: Decimal,
}

impl From<RoomOffer> for OfferView {
    fn from(o: RoomOffer) -> Self {
        Self {
            room_type_id: o.room_type_id,
            room_type_name: o.room_type_name,
            max_occupancy: o.max_occupancy,
            available_units: o.available_units,
            rate_plan_id: o.rate_plan_id,
            rate_plan_name: o.rate_plan_name,
            nightly_prices: o.quote.nightly,
            total_price: o.quote.total,
            average_per_night: o.quote.average_per_night,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub success: bool,
    pub message: String,
    pub offers: Vec<OfferView>,
    pub alternative_dates: Vec<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightAuditResponse {
    pub success: bool,
    pub message: String,
    /// -1 when the run failed.
    pub updated_count: i64,
    pub room_ids: Vec<RoomId>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldCleanupResponse {
    pub success: bool,
    pub message: String,
    /// -1 when the run failed.
    pub released_count: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

// ── Service ──────────────────────────────────────────────

/// Entry point for the transport layer.
pub struct HotelService {
    engine: Arc<Engine>,
    hold_ttl: chrono::Duration,
    night_audit: Arc<Sweeper<NightAuditJob>>,
    hold_cleanup: Arc<Sweeper<HoldCleanupJob>>,
}

/// Text shown to the caller. Infrastructure details stay in the log.
fn failure_message(operation: &'static str, err: &EngineError) -> String {
    match err.class() {
        ErrorClass::Infrastructure => {
            error!("{operation} failed: {err}");
            INTERNAL_ERROR.to_string()
        }
        ErrorClass::Validation | ErrorClass::Conflict => {
            debug!("{operation} rejected: {err}");
            err.to_string()
        }
    }
}

fn record(operation: &'static str, success: bool, start: Instant) {
    let outcome = if success { "ok" } else { "rejected" };
    metrics::counter!(observability::REQUESTS_TOTAL, "operation" => operation, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "operation" => operation)
        .record(start.elapsed().as_secs_f64());
}

impl HotelService {
    pub fn new(
        engine: Arc<Engine>,
        hold_ttl: chrono::Duration,
        night_audit: Arc<Sweeper<NightAuditJob>>,
        hold_cleanup: Arc<Sweeper<HoldCleanupJob>>,
    ) -> Self {
        Self {
            engine,
            hold_ttl,
            night_audit,
            hold_cleanup,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run a mutation to completion on its own task. Dropping the caller's
    /// future only stops waiting; the commit still lands whole or not at all.
    async fn detached<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(Arc<Engine>) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(f(self.engine.clone()))
            .await
            .map_err(|e| EngineError::Inconsistent(format!("{operation} task failed: {e}")))?
    }

    pub async fn create_hold(&self, req: CreateHoldRequest) -> HoldResponse {
        let start = Instant::now();
        let ttl = self.hold_ttl;
        let result = self
            .detached("create_hold", move |engine| async move {
                engine
                    .create_hold(
                        &req.session_id,
                        req.guest_account_id,
                        req.room_type_id,
                        req.check_in,
                        req.check_out,
                        ttl,
                    )
                    .await
            })
            .await;
        record("create_hold", result.is_ok(), start);
        match result {
            Ok(receipt) => HoldResponse {
                success: true,
                message: format!("held {} nights", receipt.holds.len()),
                hold_expiry: Some(receipt.hold_expiry),
            },
            Err(e) => HoldResponse {
                success: false,
                message: failure_message("create_hold", &e),
                hold_expiry: None,
            },
        }
    }

    pub async fn create_booking(&self, req: CreateBookingRequest) -> CreateBookingResponse {
        let start = Instant::now();
        let new = NewBooking {
            guest_id: req.guest_id,
            session_id: req.session_id,
            voucher_code: req.voucher_code,
            details: req.details,
        };
        let result = self
            .detached("create_booking", move |engine| async move {
                engine.create_booking(new).await
            })
            .await;
        record("create_booking", result.is_ok(), start);
        match result {
            Ok(booking) => CreateBookingResponse {
                success: true,
                message: "booking created, awaiting payment".into(),
                booking_id: Some(booking.id),
                total_amount: Some(booking.total_amount),
                status: Some(booking.status),
            },
            Err(e) => CreateBookingResponse {
                success: false,
                message: failure_message("create_booking", &e),
                booking_id: None,
                total_amount: None,
                status: None,
            },
        }
    }

    pub async fn confirm_booking(&self, booking_id: BookingId) -> ActionResponse {
        let start = Instant::now();
        let result = self
            .detached("confirm_booking", move |engine| async move {
                engine.confirm_booking(booking_id).await
            })
            .await;
        record("confirm_booking", result.is_ok(), start);
        match result {
            Ok(_) => ActionResponse {
                success: true,
                message: "booking confirmed".into(),
            },
            Err(e) => ActionResponse {
                success: false,
                message: failure_message("confirm_booking", &e),
            },
        }
    }

    pub async fn cancel_booking(&self, req: CancelBookingRequest) -> CancelBookingResponse {
        let start = Instant::now();
        let result = self
            .detached("cancel_booking", move |engine| async move {
                engine.cancel_booking(req.booking_id, req.guest_id).await
            })
            .await;
        record("cancel_booking", result.is_ok(), start);
        match result {
            Ok(c) => CancelBookingResponse {
                success: true,
                message: "booking cancelled".into(),
                refund_amount: c.refund_amount,
            },
            Err(e) => CancelBookingResponse {
                success: false,
                message: failure_message("cancel_booking", &e),
                refund_amount: None,
            },
        }
    }

    pub async fn mark_no_show(&self, booking_id: BookingId) -> ActionResponse {
        let start = Instant::now();
        let result = self
            .detached("mark_no_show", move |engine| async move {
                engine.mark_no_show(booking_id).await
            })
            .await;
        record("mark_no_show", result.is_ok(), start);
        match result {
            Ok(_) => ActionResponse {
                success: true,
                message: "booking marked as no-show".into(),
            },
            Err(e) => ActionResponse {
                success: false,
                message: failure_message("mark_no_show", &e),
            },
        }
    }

    pub async fn check_in(&self, req: CheckInRequest) -> CheckInResponse {
        let start = Instant::now();
        let result = self
            .detached("check_in", move |engine| async move {
                engine.check_in(req.booking_detail_id, req.room_id).await
            })
            .await;
        record("check_in", result.is_ok(), start);
        match result {
            Ok(receipt) => CheckInResponse {
                success: true,
                message: format!("checked into room {}", receipt.room_number),
                room_number: Some(receipt.room_number),
                assignment_id: Some(receipt.assignment.id),
            },
            Err(e) => CheckInResponse {
                success: false,
                message: failure_message("check_in", &e),
                room_number: None,
                assignment_id: None,
            },
        }
    }

    pub async fn check_out(&self, booking_id: BookingId) -> CheckOutResponse {
        let start = Instant::now();
        let result = self
            .detached("check_out", move |engine| async move {
                engine.check_out(booking_id).await
            })
            .await;
        record("check_out", result.is_ok(), start);
        match result {
            Ok(booking) => CheckOutResponse {
                success: true,
                message: "checked out".into(),
                total_amount: Some(booking.total_amount),
            },
            Err(e) => CheckOutResponse {
                success: false,
                message: failure_message("check_out", &e),
                total_amount: None,
            },
        }
    }

    pub async fn move_room(&self, req: MoveRoomRequest) -> MoveRoomResponse {
        let start = Instant::now();
        let result = self
            .detached("move_room", move |engine| async move {
                engine.move_room(req.assignment_id, req.new_room_id).await
            })
            .await;
        record("move_room", result.is_ok(), start);
        match result {
            Ok(receipt) => MoveRoomResponse {
                success: true,
                message: format!("moved to room {}", receipt.room_number),
                new_room_number: Some(receipt.room_number),
                assignment_id: Some(receipt.assignment.id),
            },
            Err(e) => MoveRoomResponse {
                success: false,
                message: failure_message("move_room", &e),
                new_room_number: None,
                assignment_id: None,
            },
        }
    }

    pub async fn update_inventory(&self, req: UpdateInventoryRequest) -> InventoryResponse {
        let start = Instant::now();
        let result = self
            .detached("update_inventory", move |engine| async move {
                engine
                    .set_allotment(req.room_type_id, req.date, req.allotment)
                    .await
            })
            .await;
        record("update_inventory", result.is_ok(), start);
        inventory_response("update_inventory", result.map(|_| 1))
    }

    pub async fn bulk_update_inventory(&self, req: BulkUpdateInventoryRequest) -> InventoryResponse {
        let start = Instant::now();
        let result = self
            .detached("bulk_update_inventory", move |engine| async move {
                engine
                    .bulk_set_allotment(req.room_type_id, req.start_date, req.end_date, req.allotment)
                    .await
            })
            .await;
        record("bulk_update_inventory", result.is_ok(), start);
        inventory_response("bulk_update_inventory", result)
    }

    pub async fn update_housekeeping(&self, room_id: RoomId, status: HousekeepingStatus) -> RoomResponse {
        let start = Instant::now();
        let result = self
            .detached("update_housekeeping", move |engine| async move {
                engine.update_housekeeping(room_id, status).await
            })
            .await;
        record("update_housekeeping", result.is_ok(), start);
        room_response("update_housekeeping", result)
    }

    pub async fn inspect_room(&self, room_id: RoomId, approved: bool) -> RoomResponse {
        let start = Instant::now();
        let result = self
            .detached("inspect_room", move |engine| async move {
                engine.inspect_room(room_id, approved).await
            })
            .await;
        record("inspect_room", result.is_ok(), start);
        room_response("inspect_room", result)
    }

    /// Read path plus lazy row creation; cancelled by dropping.
    pub async fn search_availability(&self, query: SearchQuery) -> SearchResponse {
        let start = Instant::now();
        let result = self.engine.search_availability(&query).await;
        record("search_availability", result.is_ok(), start);
        match result {
            Ok(found) => SearchResponse {
                success: true,
                message: if found.offers.is_empty() {
                    "no rooms available, try another check-in date".into()
                } else {
                    format!("{} offers", found.offers.len())
                },
                offers: found.offers.into_iter().map(OfferView::from).collect(),
                alternative_dates: found.alternative_dates,
            },
            Err(e) => SearchResponse {
                success: false,
                message: failure_message("search_availability", &e),
                offers: Vec::new(),
                alternative_dates: Vec::new(),
            },
        }
    }

    // ── Sweeper admin ────────────────────────────────────

    pub async fn trigger_night_audit(&self) -> NightAuditResponse {
        match self.night_audit.trigger().await {
            Ok(RunRecord { summary, output }) => NightAuditResponse {
                success: summary.success,
                message: summary.message,
                updated_count: summary.affected,
                room_ids: output.unwrap_or_default(),
                started_at: Some(summary.started_at),
                duration_ms: summary.duration_ms,
            },
            Err(e) => NightAuditResponse {
                success: false,
                message: e.to_string(),
                updated_count: -1,
                room_ids: Vec::new(),
                started_at: None,
                duration_ms: 0,
            },
        }
    }

    pub fn night_audit_status(&self) -> SweepStatus {
        self.night_audit.status()
    }

    pub async fn trigger_hold_cleanup(&self) -> HoldCleanupResponse {
        match self.hold_cleanup.trigger().await {
            Ok(RunRecord { summary, .. }) => HoldCleanupResponse {
                success: summary.success,
                message: summary.message,
                released_count: summary.affected,
                started_at: Some(summary.started_at),
                duration_ms: summary.duration_ms,
            },
            Err(e) => HoldCleanupResponse {
                success: false,
                message: e.to_string(),
                released_count: -1,
                started_at: None,
                duration_ms: 0,
            },
        }
    }

    pub fn hold_cleanup_status(&self) -> SweepStatus {
        self.hold_cleanup.status()
    }
}

fn inventory_response(operation: &'static str, result: Result<usize, EngineError>) -> InventoryResponse {
    match result {
        Ok(updated) => InventoryResponse {
            success: true,
            message: format!("allotment updated on {updated} dates"),
            updated,
            errors: Vec::new(),
        },
        Err(EngineError::AllotmentBelowCommitted(violations)) => {
            debug!("{operation} rejected on {} dates", violations.len());
            InventoryResponse {
                success: false,
                message: "allotment below booked and held units".into(),
                updated: 0,
                errors: violations
                    .iter()
                    .map(|v| InventoryError {
                        date: Some(v.date),
                        message: v.to_string(),
                    })
                    .collect(),
            }
        }
        Err(e) => {
            let message = failure_message(operation, &e);
            InventoryResponse {
                success: false,
                errors: vec![InventoryError {
                    date: None,
                    message: message.clone(),
                }],
                message,
                updated: 0,
            }
        }
    }
}

fn room_response(operation: &'static str, result: Result<RoomState, EngineError>) -> RoomResponse {
    match result {
        Ok(room) => RoomResponse {
            success: true,
            message: format!("room {} is {}", room.number, room.housekeeping),
            housekeeping_status: Some(room.housekeeping),
        },
        Err(e) => RoomResponse {
            success: false,
            message: failure_message(operation, &e),
            housekeeping_status: None,
        },
    }
}
