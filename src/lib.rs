//! Endpoint Copier Operator - keeps a managed Service alias pointed at the same
//! backends as a default Service
//!
//! The operator watches a source ("default") Service's endpoint objects and
//! republishes its addresses under a managed Service, remapping ports on the way.
//! Clients of the managed alias always see the same healthy backends as clients
//! of the source.
//!
//! # Sync modes
//!
//! - **Whole-object** (`Endpoints`): a single managed `Endpoints` record is
//!   overwritten on every source change.
//! - **Per-slice** (`EndpointSlice`): one managed slice per source slice, written
//!   with server-side apply and garbage collected when the source disappears.
//!
//! # Modules
//!
//! - [`identity`] - Resolves the (source, managed) pair for a reconciliation
//! - [`filter`] - Decides which watch events enqueue a reconciliation
//! - [`mapper`] - Computes desired addresses and ports
//! - [`controller`] - Sync strategies, garbage collection and the dispatcher
//! - [`runner`] - Builds the kube-runtime controllers
//! - [`config`] - Process configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod filter;
pub mod health;
pub mod identity;
pub mod leader_election;
pub mod mapper;
pub mod metrics;
pub mod runner;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Operator identity
// =============================================================================
// Written into labels and used as the server-side apply field manager. These are
// compared against objects already in the cluster, so changing any of them
// orphans records written by earlier versions.

/// Name of the operator, used as the `managed-by` label value
pub const OPERATOR_NAME: &str = "endpoint-copier-operator";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = OPERATOR_NAME;

// =============================================================================
// Labels
// =============================================================================

/// Label identifying the controller that owns an endpoint record
pub const MANAGED_BY_LABEL: &str = "endpointslice.kubernetes.io/managed-by";

/// Label linking an EndpointSlice to the Service it serves
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Label recording which source EndpointSlice a managed slice was derived from
pub const SOURCE_SLICE_LABEL: &str = "endpoint-copier-operator/source-slice";

/// Label recording the name of the source Service a managed slice was derived from
pub const SOURCE_SERVICE_LABEL: &str = "endpoint-copier-operator/source-service";

/// Label recording the namespace of the source Service a managed slice was derived from
pub const SOURCE_NAMESPACE_LABEL: &str = "endpoint-copier-operator/source-namespace";

// =============================================================================
// Annotations
// =============================================================================
// Read from the managed object. Only the exact string "true" enables dynamic mode.

/// Annotation enabling per-object (dynamic) configuration
pub const ENABLED_ANNOTATION: &str = "endpoint-copier-operator/enabled";

/// Annotation naming the source Service
pub const SOURCE_NAME_ANNOTATION: &str = "endpoint-copier-operator/source-name";

/// Annotation naming the source Service's namespace
pub const SOURCE_NAMESPACE_ANNOTATION: &str = "endpoint-copier-operator/source-namespace";

/// Default protocol when a Service port leaves it unset
pub const DEFAULT_PROTOCOL: &str = "TCP";
