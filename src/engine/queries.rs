use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::ledger::validate_stay;
use super::{Engine, EngineError};
use crate::catalog::RatePlan;
use crate::model::*;
use crate::pricing::{Quote, alternative_dates};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub num_guests: u32,
    #[serde(default)]
    pub rate_plan_id: Option<RatePlanId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomOffer {
    pub room_type_id: RoomTypeId,
    pub room_type_name: String,
    pub max_occupancy: u32,
    /// Fewest free units on any night of the stay.
    pub available_units: u32,
    pub rate_plan_id: RatePlanId,
    pub rate_plan_name: String,
    pub quote: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub offers: Vec<RoomOffer>,
    /// Only filled when `offers` is empty.
    pub alternative_dates: Vec<NaiveDate>,
}

impl Engine {
    pub async fn search_availability(&self, query: &SearchQuery) -> Result<SearchResult, EngineError> {
        let today = self.clock.today();
        let stay = validate_stay(query.check_in, query.check_out, today)?;
        if query.num_guests == 0 {
            return Err(EngineError::Validation("at least one guest is required".into()));
        }
        let plans: Vec<&RatePlan> = match query.rate_plan_id {
            Some(id) => vec![self.catalog.rate_plan(id).ok_or_else(|| {
                EngineError::Validation(format!("unknown rate plan {id}"))
            })?],
            None => self.catalog.rate_plans.values().collect(),
        };

        let mut offers = Vec::new();
        for room_type in self.catalog.room_types.values() {
            if room_type.max_occupancy < query.num_guests {
                continue;
            }
            self.ensure(room_type.id, stay).await?;
            let Some(handle) = self.partition(room_type.id) else {
                continue;
            };
            let available_units = {
                let partition = handle.read().await;
                stay.dates().map(|d| partition.available(d)).min().unwrap_or(0)
            };
            if available_units == 0 {
                continue;
            }
            for plan in &plans {
                offers.push(RoomOffer {
                    room_type_id: room_type.id,
                    room_type_name: room_type.name.clone(),
                    max_occupancy: room_type.max_occupancy,
                    available_units,
                    rate_plan_id: plan.id,
                    rate_plan_name: plan.name.clone(),
                    quote: self.catalog.pricing.quote(room_type.id, plan.id, stay),
                });
            }
        }

        let alternative_dates = if offers.is_empty() {
            alternative_dates(stay.check_in, today)
        } else {
            Vec::new()
        };
        Ok(SearchResult {
            offers,
            alternative_dates,
        })
    }

    pub async fn get_booking(&self, booking_id: BookingId) -> Option<Booking> {
        let handle = self.booking_handle(&booking_id)?;
        let record = handle.lock().await;
        Some(record.booking.clone())
    }

    pub async fn booking_record(&self, booking_id: BookingId) -> Option<BookingRecord> {
        let handle = self.booking_handle(&booking_id)?;
        let record = handle.lock().await;
        Some(record.clone())
    }

    pub async fn nightly_log(&self, booking_id: BookingId) -> Option<Vec<NightlyLogEntry>> {
        let handle = self.booking_handle(&booking_id)?;
        let record = handle.lock().await;
        Some(record.nightly_log.clone())
    }

    /// Every hold of a session, claimed or not, ordered by room type and date.
    pub async fn list_holds(&self, session_id: &str) -> Vec<HoldRow> {
        let handles: Vec<_> = self.ledger.iter().map(|e| e.value().clone()).collect();
        let mut holds = Vec::new();
        for handle in handles {
            let partition = handle.read().await;
            holds.extend(
                partition
                    .holds
                    .values()
                    .filter(|h| h.session_id == session_id)
                    .cloned(),
            );
        }
        holds.sort_by_key(|h| (h.room_type_id, h.date, h.id));
        holds
    }

    /// Ledger rows for each night of `stay`, including rows not created yet.
    pub async fn inventory_snapshot(
        &self,
        room_type_id: RoomTypeId,
        stay: StayRange,
    ) -> Result<Vec<InventoryRow>, EngineError> {
        let handle = self
            .partition(room_type_id)
            .ok_or_else(|| EngineError::not_found("room type", room_type_id))?;
        let partition = handle.read().await;
        Ok(stay.dates().map(|d| partition.row_or_default(d)).collect())
    }

    pub async fn get_room(&self, room_id: RoomId) -> Option<RoomState> {
        let handle = self.room_handle(room_id)?;
        let room = handle.read().await;
        Some(room.clone())
    }

    pub async fn list_rooms(&self) -> Vec<RoomState> {
        let mut handles: Vec<_> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        let mut rooms = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            rooms.push(handle.read().await.clone());
        }
        rooms
    }

    pub fn voucher_used(&self, code: &str) -> u32 {
        self.voucher_usage.get(code).map(|e| *e.value()).unwrap_or(0)
    }
}
