//! Interface to the external ledger validation engine.
//!
//! The transaction/ledger engine is an external collaborator: the framework
//! only needs to know when a transaction it is waiting on becomes persisted.
//! Nodes forward those notifications into
//! [`FlowManager::notify_transaction_committed`](crate::runtime::FlowManager::notify_transaction_committed),
//! which unparks `waitForLedgerCommit` suspensions and records the
//! (run-id, tx-id) association on the transaction-mapping feed.

use chrono::{DateTime, Utc};

use crate::types::{RunId, TxId};

/// A recorded association between a flow run and a persisted transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedTransaction {
    pub run_id: RunId,
    pub tx_id: TxId,
    pub recorded_at: DateTime<Utc>,
}

impl RecordedTransaction {
    #[must_use]
    pub fn new(run_id: RunId, tx_id: TxId) -> Self {
        Self {
            run_id,
            tx_id,
            recorded_at: Utc::now(),
        }
    }
}
