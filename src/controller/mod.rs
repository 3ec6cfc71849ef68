//! Reconciliation logic for the endpoint copier
//!
//! Two sync strategies share one dispatcher. The strategy is chosen once at
//! startup from [`SyncMode`](crate::config::SyncMode).

mod client;
mod dispatch;
mod endpoints;
mod slices;

#[cfg(test)]
pub use client::MockKubeClient;
pub use client::{KubeClient, KubeClientImpl};
pub use dispatch::{
    dispatch, error_policy, reconcile_endpoints, reconcile_service, Context, ContextBuilder,
};
pub use endpoints::{desired_endpoints, sync_endpoints};
pub use slices::{
    collect_garbage, desired_slice, managed_slice_name, managed_slice_selector, release_slices,
    select_derived, select_stale, sync_slices,
};

/// Result of one reconciliation, used for logging and metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Managed state was written
    Synced,
    /// Managed state already matched; nothing was written
    Unchanged,
    /// The source does not exist (whole-object strategy waits for it)
    SourceMissing,
    /// The managed target does not exist yet
    ManagedMissing,
    /// The source is gone and managed slices derived from it were removed
    CleanedUp,
    /// The trigger is no longer managed and its slices were removed
    Released,
}

impl Outcome {
    /// Stable label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Synced => "synced",
            Outcome::Unchanged => "unchanged",
            Outcome::SourceMissing => "source_missing",
            Outcome::ManagedMissing => "managed_missing",
            Outcome::CleanedUp => "cleaned_up",
            Outcome::Released => "released",
        }
    }
}
