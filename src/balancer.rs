use crate::pairing::{PairedLedger, PairedLedgerRecord};
use log::debug;
use std::collections::HashSet;

pub struct BalanceCanceler<'a> {
    ledger: &'a PairedLedger,
}

impl<'a> BalanceCanceler<'a> {
    pub fn new(ledger: &'a PairedLedger) -> Self {
        Self { ledger }
    }

    /// A record is balanced when its counterparts offset it exactly.
    pub fn is_balanced(record: PairedLedgerRecord<'_>) -> bool {
        record.balance().checked_add(record.relations.counterparts_sum) == Some(0)
    }

    /// Serial numbers removed by cancellation: every balanced record plus all of its
    /// counterparts.
    pub fn cancelled_serials(&self) -> HashSet<&'a str> {
        let mut cancelled = HashSet::new();

        for paired in self.ledger.iter() {
            if !Self::is_balanced(paired) {
                continue;
            }
            cancelled.insert(paired.record.sr_no());
            for counterpart in &paired.relations.counterparts {
                cancelled.insert(counterpart.as_str());
            }
        }

        cancelled
    }

    pub fn remove_balanced_records(&self) -> PairedLedger {
        let cancelled = self.cancelled_serials();
        let remaining = self
            .ledger
            .filtered(|paired| !cancelled.contains(paired.sr_no()));

        debug!(
            "Balance cancellation removed {} of {} records",
            self.ledger.len() - remaining.len(),
            self.ledger.len()
        );

        remaining
    }
}

pub fn remove_balanced_records(ledger: &PairedLedger) -> PairedLedger {
    BalanceCanceler::new(ledger).remove_balanced_records()
}
