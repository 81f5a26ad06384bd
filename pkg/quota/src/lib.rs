//! Quota/reservation ledger.
//!
//! [`QuotaLedger`] owns usage counters and reservations; [`QuotaEngine`]
//! resolves effective limits and is what request handlers call;
//! [`ReservationExpiryController`] reclaims abandoned reservations.

pub mod engine;
pub mod error;
pub mod expiry;
pub mod ledger;
pub mod limits;
pub mod resources;

pub use engine::{Expiry, QuotaEngine, QuotaView};
pub use error::{OverQuota, OverQuotaResource, QuotaError};
pub use expiry::ReservationExpiryController;
pub use ledger::{QuotaLedger, ReservePolicy};
pub use resources::{ObjectKind, ObjectTotals, ResourceRegistry, ResourceSyncer, UsageSource};
