//! The file registry and the only code allowed to mutate it.
//!
//! Snapshots and deltas enter through [`StateReconciler::apply_snapshot`] and
//! [`StateReconciler::apply_delta`], and the client's own upload receipts
//! through [`StateReconciler::announce`]. Every call is atomic with respect to the
//! registry and consumers only ever receive cloned records.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::files::api::{FileId, FileRecord, ScanStatus};

use super::{ProtocolAnomaly, StatusDelta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// The record changed.
    Updated,
    /// The delta matched the current record exactly.
    Unchanged,
    /// The id was unknown; a provisional stub was inserted and a repair
    /// snapshot is needed to backfill it.
    NeedsRepair,
    /// The delta violated the status lifecycle and was ignored.
    Rejected(ProtocolAnomaly),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub inserted: usize,
    pub updated: usize,
    pub resolved_stubs: usize,
}

impl SnapshotSummary {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.resolved_stubs > 0
    }
}

#[derive(Debug, Default)]
pub struct StateReconciler {
    records: BTreeMap<FileId, FileRecord>,
    provisional: BTreeSet<FileId>,
}

impl StateReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current registry, highest id first so the newest uploads lead.
    pub fn records(&self) -> Vec<FileRecord> {
        self.records.values().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True while any delta-only stub is still waiting for its snapshot.
    pub fn needs_repair(&self) -> bool {
        !self.provisional.is_empty()
    }

    /// Merge an authoritative list. Each incoming record overwrites the local
    /// one by id; records missing from the list are kept. A provisional stub
    /// is replaced by the snapshot record with the stub's delta fields laid on
    /// top, as long as that does not move the status backwards.
    pub fn apply_snapshot(&mut self, records: Vec<FileRecord>) -> SnapshotSummary {
        let mut summary = SnapshotSummary::default();

        for incoming in records {
            let id = incoming.id.clone();
            if self.provisional.remove(&id) {
                let merged = match self.records.get(&id) {
                    Some(stub) => overlay_stub(incoming, stub),
                    None => incoming,
                };
                debug!(file_id = %id, "provisional record backfilled from snapshot");
                self.records.insert(id, merged);
                summary.resolved_stubs += 1;
                continue;
            }

            match self.records.get(&id) {
                Some(existing) if *existing == incoming => {}
                Some(_) => {
                    self.records.insert(id, incoming);
                    summary.updated += 1;
                }
                None => {
                    self.records.insert(id, incoming);
                    summary.inserted += 1;
                }
            }
        }

        if !self.provisional.is_empty() {
            debug!(
                pending = self.provisional.len(),
                "snapshot did not cover every provisional record"
            );
        }
        summary
    }

    /// Record a file this client just uploaded. An unknown id is inserted as
    /// is. A known id only gains the fields it is still missing, and its status
    /// moves only where the lifecycle allows, so a receipt that arrives after
    /// the status channel has reported further progress changes nothing.
    /// Returns whether the registry changed.
    pub fn announce(&mut self, receipt: FileRecord) -> bool {
        let Some(record) = self.records.get_mut(&receipt.id) else {
            debug!(file_id = %receipt.id, "announced file inserted");
            self.records.insert(receipt.id.clone(), receipt);
            return true;
        };

        let before = record.clone();
        if check_transition(&receipt.id, record.scan_status, receipt.scan_status).is_ok() {
            record.scan_status = receipt.scan_status;
        } else {
            debug!(
                file_id = %receipt.id,
                current = %record.scan_status,
                announced = %receipt.scan_status,
                "receipt is older than the registry; keeping status"
            );
        }
        backfill(&mut record.filename, receipt.filename);
        backfill(&mut record.filesize, receipt.filesize);
        backfill(&mut record.upload_date, receipt.upload_date);
        backfill(&mut record.scan_details, receipt.scan_details);
        backfill(&mut record.checksum, receipt.checksum);
        *record != before
    }

    pub fn apply_delta(&mut self, delta: StatusDelta) -> DeltaOutcome {
        let Some(record) = self.records.get_mut(&delta.file_id) else {
            debug!(file_id = %delta.file_id, status = %delta.status, "delta for unknown file; inserting stub");
            let mut stub = FileRecord::partial(delta.file_id.clone(), delta.status);
            stub.scan_details = delta.details;
            stub.checksum = delta.checksum;
            self.provisional.insert(delta.file_id.clone());
            self.records.insert(delta.file_id, stub);
            return DeltaOutcome::NeedsRepair;
        };

        if let Err(anomaly) = check_transition(&delta.file_id, record.scan_status, delta.status) {
            warn!(%anomaly, "ignoring out-of-order status delta");
            return DeltaOutcome::Rejected(anomaly);
        }

        let before = record.clone();
        record.scan_status = delta.status;
        if let Some(details) = delta.details {
            record.scan_details = Some(details);
        }
        if let Some(checksum) = delta.checksum {
            record.checksum = Some(checksum);
        }

        if *record == before {
            DeltaOutcome::Unchanged
        } else {
            DeltaOutcome::Updated
        }
    }
}

#[cfg(test)]
impl StateReconciler {
    fn get(&self, id: &FileId) -> Option<FileRecord> {
        self.records.get(id).cloned()
    }

    fn is_provisional(&self, id: &FileId) -> bool {
        self.provisional.contains(id)
    }
}

/// Status may only move forward along `pending -> scanning -> terminal`, and a
/// terminal status is final. Repeating the current status is always allowed.
pub fn check_transition(
    id: &FileId,
    from: ScanStatus,
    to: ScanStatus,
) -> Result<(), ProtocolAnomaly> {
    if from == to {
        return Ok(());
    }
    if from.is_terminal() {
        return Err(ProtocolAnomaly::TerminalRewrite {
            id: id.clone(),
            from,
            to,
        });
    }
    if to.stage() < from.stage() {
        return Err(ProtocolAnomaly::StatusRegression {
            id: id.clone(),
            from,
            to,
        });
    }
    Ok(())
}

fn backfill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn overlay_stub(mut base: FileRecord, stub: &FileRecord) -> FileRecord {
    if check_transition(&base.id, base.scan_status, stub.scan_status).is_err() {
        // The snapshot is already further along than the delta that created
        // the stub; the stub has nothing newer to contribute.
        return base;
    }
    base.scan_status = stub.scan_status;
    if stub.scan_details.is_some() {
        base.scan_details = stub.scan_details.clone();
    }
    if stub.checksum.is_some() {
        base.checksum = stub.checksum.clone();
    }
    base
}
