use tokio::sync::oneshot;

use super::{Engine, EngineError, WalCommand};
use crate::model::*;

impl Engine {
    /// Rewrite the WAL as the minimal set of commits recreating current state.
    ///
    /// Holds the commit gate exclusively, so no mutation is in flight while
    /// the snapshot is taken and swapped in.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let commits = self.snapshot_commits().await;
        let count = commits.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                commits,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} commits");
        Ok(())
    }

    async fn snapshot_commits(&self) -> Vec<Commit> {
        let mut commits = Vec::new();

        let mut partitions: Vec<_> = self
            .ledger
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        partitions.sort_by_key(|(id, _)| *id);
        for (room_type_id, handle) in partitions {
            let p = handle.read().await;
            let mut commit = Vec::new();
            if !p.rows.is_empty() {
                commit.push(Event::InventoryWritten {
                    room_type_id,
                    rows: p.rows.values().copied().collect(),
                });
            }
            if !p.holds.is_empty() {
                commit.push(Event::HoldsWritten {
                    room_type_id,
                    holds: p.holds.values().cloned().collect(),
                });
            }
            if !commit.is_empty() {
                commits.push(commit);
            }
        }

        let bookings: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for handle in bookings {
            let record = handle.lock().await;
            let mut commit = vec![Event::BookingCreated {
                booking: record.booking.clone(),
            }];
            if !record.nightly_log.is_empty() {
                commit.push(Event::NightlyLogged {
                    booking_id: record.booking.id,
                    entries: record.nightly_log.clone(),
                });
            }
            commit.extend(record.assignments.iter().map(|a| Event::AssignmentOpened {
                assignment: a.clone(),
            }));
            commits.push(commit);
        }

        let mut rooms = Vec::new();
        for state in self.list_rooms().await {
            rooms.push(Event::RoomUpdated {
                room_id: state.id,
                occupancy: state.occupancy,
                housekeeping: state.housekeeping,
            });
        }
        if !rooms.is_empty() {
            commits.push(rooms);
        }

        let vouchers: Commit = self
            .voucher_usage
            .iter()
            .map(|e| Event::VoucherUsed {
                code: e.key().clone(),
                used_count: *e.value(),
            })
            .collect();
        if !vouchers.is_empty() {
            commits.push(vouchers);
        }
        commits
    }
}
