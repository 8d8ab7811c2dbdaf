use tracing::info;

use super::holds::release_holds;
use super::{Engine, EngineError};
use crate::model::*;

impl Engine {
    /// Release every expired, unclaimed hold in one commit.
    ///
    /// Holds claimed by a pending booking never expire here; they are
    /// consumed by confirm or cancel.
    pub async fn release_expired_holds(&self) -> Result<usize, EngineError> {
        let mut txn = self.begin().await;
        let ids: Vec<RoomTypeId> = self.ledger.iter().map(|e| *e.key()).collect();
        self.lock_partitions(&mut txn, ids).await?;
        let now = self.clock.now();

        let mut commit = Vec::new();
        let mut released = 0;
        for (&room_type_id, partition) in &txn.partitions {
            let expired: Vec<&HoldRow> = partition
                .holds
                .values()
                .filter(|h| !h.is_claimed() && h.is_expired(now))
                .collect();
            released += expired.len();
            commit.extend(release_holds(partition, room_type_id, &expired));
        }
        self.commit(&mut txn, commit).await?;
        if released > 0 {
            info!("released {released} expired holds");
        }
        Ok(released)
    }

    /// Night audit: every occupied room not already Dirty becomes Dirty.
    /// Returns the affected room ids, ascending.
    pub async fn mark_occupied_rooms_dirty(&self) -> Result<Vec<RoomId>, EngineError> {
        let mut txn = self.begin().await;
        let ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        self.lock_rooms(&mut txn, ids).await?;

        let affected: Vec<RoomId> = txn
            .rooms
            .values()
            .filter(|r| {
                r.occupancy == OccupancyStatus::Occupied
                    && r.housekeeping != HousekeepingStatus::Dirty
            })
            .map(|r| r.id)
            .collect();
        let commit = affected
            .iter()
            .map(|&room_id| Event::RoomUpdated {
                room_id,
                occupancy: OccupancyStatus::Occupied,
                housekeeping: HousekeepingStatus::Dirty,
            })
            .collect();
        self.commit(&mut txn, commit).await?;
        Ok(affected)
    }
}
