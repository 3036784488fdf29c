//! Content identity: compare a snapshot fingerprint with the last accepted one.

use agip_core::{FingerprintStatus, Verdict};
use agip_storage::{WarehouseError, WarehouseTx};
use tracing::debug;

use crate::registry::ChangeDetection;

/// Outcome of the content-identity check for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCheck {
    pub status: FingerprintStatus,
    pub last_accepted: Option<String>,
    /// Whether staging currently holds this exact content under an
    /// accepting verdict.
    pub staging_current: bool,
}

impl IdentityCheck {
    pub fn new(
        fingerprint: &str,
        last_accepted: Option<String>,
        last_restaged: Option<(String, Verdict)>,
    ) -> Self {
        let staging_current = last_restaged
            .is_some_and(|(hash, verdict)| hash == fingerprint && verdict.is_accepting());
        Self {
            status: FingerprintStatus::classify(fingerprint, last_accepted.as_deref()),
            last_accepted,
            staging_current,
        }
    }

    /// Whether staging must be rebuilt under `mode`. Unchanged content is
    /// only skipped when the last rebuild staged that same content and was
    /// accepted; a failed rebuild in between leaves its rows in staging.
    pub fn needs_restage(&self, mode: ChangeDetection) -> bool {
        match mode {
            ChangeDetection::AlwaysRebuild => true,
            ChangeDetection::SkipUnchanged => {
                self.status != FingerprintStatus::Unchanged || !self.staging_current
            }
        }
    }
}

/// Reads the ledger inside the invocation's transaction.
pub async fn check<T: WarehouseTx>(
    tx: &mut T,
    dataset: &str,
    fingerprint: &str,
) -> Result<IdentityCheck, WarehouseError> {
    let last_accepted = tx.last_accepted_fingerprint(dataset).await?;
    let last_restaged = tx.last_restaged_fingerprint(dataset).await?;
    let check = IdentityCheck::new(fingerprint, last_accepted, last_restaged);
    debug!(
        dataset,
        status = %check.status,
        staging_current = check.staging_current,
        "fingerprint compared"
    );
    Ok(check)
}
