use tracing::info;
use ulid::Ulid;

use super::bookings::end_assignments;
use super::{Engine, EngineError};
use crate::housekeeping::{inspection_target, validate_transition};
use crate::model::*;
use crate::observability;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckInReceipt {
    pub assignment: RoomAssignment,
    pub room_number: String,
}

fn ensure_room_ready(room: &RoomState, room_type_id: RoomTypeId) -> Result<(), EngineError> {
    let unavailable = |reason: String| EngineError::RoomUnavailable {
        room_id: room.id,
        reason,
    };
    if room.room_type_id != room_type_id {
        return Err(unavailable(format!(
            "room is type {}, booking needs {room_type_id}",
            room.room_type_id
        )));
    }
    if room.occupancy == OccupancyStatus::Occupied {
        return Err(unavailable("room is occupied".into()));
    }
    if !room.housekeeping.is_sellable() {
        return Err(unavailable(format!(
            "housekeeping status is {}",
            room.housekeeping
        )));
    }
    Ok(())
}

impl Engine {
    /// Put one booking detail into a physical room.
    pub async fn check_in(&self, detail_id: Ulid, room_id: RoomId) -> Result<CheckInReceipt, EngineError> {
        let booking_id = self
            .detail_to_booking
            .get(&detail_id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::not_found("booking detail", detail_id))?;

        let mut txn = self.begin().await;
        self.lock_booking(&mut txn, booking_id).await?;
        let record = txn.booking()?;
        let status = record.booking.status;
        if !matches!(status, BookingStatus::Confirmed | BookingStatus::CheckedIn) {
            return Err(EngineError::InvalidTransition {
                from: status,
                action: "check in",
            });
        }
        let detail = record
            .booking
            .detail(detail_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking detail", detail_id))?;
        let today = self.clock.today();
        if !detail.stay.contains(today) {
            return Err(EngineError::Validation(format!(
                "check-in on {today} is outside the stay {}",
                detail.stay
            )));
        }
        if record.active_assignment_for_detail(detail_id).is_some() {
            return Err(EngineError::Validation(format!(
                "booking detail {detail_id} is already checked in"
            )));
        }

        self.lock_rooms(&mut txn, [room_id]).await?;
        let room = txn.room(room_id)?;
        ensure_room_ready(room, detail.room_type_id)?;
        let room_number = room.number.clone();
        let housekeeping = room.housekeeping;

        let now = self.clock.now();
        let assignment = RoomAssignment {
            id: Ulid::new(),
            booking_id,
            booking_detail_id: detail_id,
            room_id,
            checked_in_at: now,
            checked_out_at: None,
            status: AssignmentStatus::Active,
        };
        let mut commit = vec![
            Event::AssignmentOpened {
                assignment: assignment.clone(),
            },
            Event::RoomUpdated {
                room_id,
                occupancy: OccupancyStatus::Occupied,
                housekeeping,
            },
        ];
        if status == BookingStatus::Confirmed {
            commit.push(Event::BookingStatusChanged {
                booking_id,
                status: BookingStatus::CheckedIn,
                at: now,
                refund_amount: None,
            });
        }
        self.commit(&mut txn, commit).await?;

        if status == BookingStatus::Confirmed {
            metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => "CheckedIn")
                .increment(1);
        }
        info!("booking {booking_id} detail {detail_id} checked into room {room_number}");
        Ok(CheckInReceipt {
            assignment,
            room_number,
        })
    }

    /// CheckedIn → Completed. Every active assignment ends and its room is
    /// left vacant and dirty.
    pub async fn check_out(&self, booking_id: BookingId) -> Result<Booking, EngineError> {
        let mut txn = self.begin().await;
        self.lock_booking(&mut txn, booking_id).await?;
        let record = txn.booking()?;
        if record.booking.status != BookingStatus::CheckedIn {
            return Err(EngineError::InvalidTransition {
                from: record.booking.status,
                action: "check out",
            });
        }
        let active: Vec<RoomAssignment> = record.active_assignments().cloned().collect();

        self.lock_rooms(&mut txn, active.iter().map(|a| a.room_id)).await?;
        let now = self.clock.now();
        let mut commit = end_assignments(&active, now);
        commit.push(Event::BookingStatusChanged {
            booking_id,
            status: BookingStatus::Completed,
            at: now,
            refund_amount: None,
        });
        self.commit(&mut txn, commit).await?;

        metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => "Completed").increment(1);
        let booking = txn.booking()?.booking.clone();
        info!("booking {booking_id} checked out, total {}", booking.total_amount);
        Ok(booking)
    }

    /// End an active assignment and reopen it on another room of the same type.
    pub async fn move_room(
        &self,
        assignment_id: Ulid,
        new_room_id: RoomId,
    ) -> Result<CheckInReceipt, EngineError> {
        let booking_id = self
            .assignment_to_booking
            .get(&assignment_id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;

        let mut txn = self.begin().await;
        self.lock_booking(&mut txn, booking_id).await?;
        let record = txn.booking()?;
        if record.booking.status != BookingStatus::CheckedIn {
            return Err(EngineError::InvalidTransition {
                from: record.booking.status,
                action: "move room",
            });
        }
        let old = record
            .assignments
            .iter()
            .find(|a| a.id == assignment_id && a.status == AssignmentStatus::Active)
            .cloned()
            .ok_or_else(|| {
                EngineError::Validation(format!("assignment {assignment_id} is not active"))
            })?;
        if old.room_id == new_room_id {
            return Err(EngineError::Validation(format!(
                "guest is already in room {new_room_id}"
            )));
        }

        self.lock_rooms(&mut txn, [old.room_id, new_room_id]).await?;
        let room_type_id = txn.room(old.room_id)?.room_type_id;
        let new_room = txn.room(new_room_id)?;
        ensure_room_ready(new_room, room_type_id)?;
        let room_number = new_room.number.clone();
        let housekeeping = new_room.housekeeping;

        let now = self.clock.now();
        let assignment = RoomAssignment {
            id: Ulid::new(),
            booking_id,
            booking_detail_id: old.booking_detail_id,
            room_id: new_room_id,
            checked_in_at: now,
            checked_out_at: None,
            status: AssignmentStatus::Active,
        };
        let mut commit = end_assignments(std::slice::from_ref(&old), now);
        commit.push(Event::AssignmentOpened {
            assignment: assignment.clone(),
        });
        commit.push(Event::RoomUpdated {
            room_id: new_room_id,
            occupancy: OccupancyStatus::Occupied,
            housekeeping,
        });
        self.commit(&mut txn, commit).await?;

        info!(
            "booking {booking_id} moved from room {} to room {room_number}",
            old.room_id
        );
        Ok(CheckInReceipt {
            assignment,
            room_number,
        })
    }

    /// Staff housekeeping update, checked against the transition table.
    pub async fn update_housekeeping(
        &self,
        room_id: RoomId,
        target: HousekeepingStatus,
    ) -> Result<RoomState, EngineError> {
        self.set_housekeeping(room_id, |from| {
            validate_transition(from, target)?;
            Ok(target)
        })
        .await
    }

    /// Approve (Clean → Inspected) or fail (Clean → Dirty) an inspection.
    pub async fn inspect_room(&self, room_id: RoomId, approved: bool) -> Result<RoomState, EngineError> {
        self.set_housekeeping(room_id, |from| Ok(inspection_target(from, approved)?))
            .await
    }

    async fn set_housekeeping(
        &self,
        room_id: RoomId,
        decide: impl FnOnce(HousekeepingStatus) -> Result<HousekeepingStatus, EngineError>,
    ) -> Result<RoomState, EngineError> {
        let mut txn = self.begin().await;
        self.lock_rooms(&mut txn, [room_id]).await?;
        let room = txn.room(room_id)?;
        let from = room.housekeeping;
        let occupancy = room.occupancy;
        let to = decide(from)?;
        self.commit(
            &mut txn,
            vec![Event::RoomUpdated {
                room_id,
                occupancy,
                housekeeping: to,
            }],
        )
        .await?;
        info!("room {room_id} housekeeping {from} -> {to}");
        Ok(txn.room(room_id)?.clone())
    }
}
