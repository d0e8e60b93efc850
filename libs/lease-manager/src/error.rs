//! Error types for lease operations.

use chrono::NaiveDate;
use thiserror::Error;

use crate::provider::ProviderError;
use crate::store::StoreError;

/// Errors surfaced by the rent/return/extend operations.
///
/// Expected rejections (duplicate name, insufficient capacity, bad
/// extension dates) are plain variants here, not panics or provider
/// errors; the excluded HTTP layer maps them to client-facing statuses.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// A lease with this name already exists somewhere in the system.
    #[error("lease name already in use: {0}")]
    DuplicateName(String),

    /// The lease name does not satisfy naming rules.
    #[error("invalid lease name: {0}")]
    InvalidName(String),

    /// The request is self-inconsistent (e.g. a new network without a CIDR).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No node has enough remaining capacity for the requested shape.
    #[error("no node with sufficient remaining capacity")]
    InsufficientCapacity,

    /// No lease with this name exists.
    #[error("lease not found: {0}")]
    NotFound(String),

    /// The supplied ownership proof did not match the lease.
    #[error("ownership proof rejected")]
    OwnershipDenied,

    /// `extend` requires a strictly later end date.
    #[error("new end date {requested} is not after current end date {current}")]
    InvalidExtension {
        current: NaiveDate,
        requested: NaiveDate,
    },

    /// Transient provider failure; the whole call may be retried.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(#[source] ProviderError),

    /// The provider rejected or failed a call.
    #[error("provider call failed: {0}")]
    Provider(#[source] ProviderError),

    /// A provisioning step failed after earlier steps completed; all
    /// completed steps have been compensated and no partial state remains
    /// in the ledger.
    #[error("provisioning failed: {cause}")]
    ProvisioningFailed {
        #[source]
        cause: Box<LeaseError>,
    },

    /// Persistent store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ProviderError> for LeaseError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unavailable(_) => LeaseError::ProviderUnavailable(e),
            ProviderError::Failed { .. } => LeaseError::Provider(e),
        }
    }
}

impl LeaseError {
    /// Wrap a mid-saga failure for the caller. Expected rejections and
    /// transient provider outages keep their own kind; everything else
    /// becomes `ProvisioningFailed` carrying the triggering cause.
    pub(crate) fn into_provisioning_failure(self) -> LeaseError {
        match self {
            e @ (LeaseError::DuplicateName(_)
            | LeaseError::InvalidName(_)
            | LeaseError::InvalidRequest(_)
            | LeaseError::InsufficientCapacity
            | LeaseError::ProviderUnavailable(_)
            | LeaseError::ProvisioningFailed { .. }) => e,
            other => LeaseError::ProvisioningFailed {
                cause: Box::new(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_mapping() {
        let transient: LeaseError = ProviderError::Unavailable("timeout".into()).into();
        assert!(matches!(transient, LeaseError::ProviderUnavailable(_)));

        let hard: LeaseError = ProviderError::Failed {
            operation: "create_server",
            message: "quota exceeded".into(),
        }
        .into();
        assert!(matches!(hard, LeaseError::Provider(_)));
    }

    #[test]
    fn test_provisioning_failure_wrapping() {
        let rejected = LeaseError::InsufficientCapacity.into_provisioning_failure();
        assert!(matches!(rejected, LeaseError::InsufficientCapacity));

        let wrapped = LeaseError::Provider(ProviderError::Failed {
            operation: "create_flavor",
            message: "boom".into(),
        })
        .into_provisioning_failure();
        assert!(matches!(wrapped, LeaseError::ProvisioningFailed { .. }));
    }
}
