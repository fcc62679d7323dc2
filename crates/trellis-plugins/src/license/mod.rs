//! Monetized installation and offline usage accounting
//!
//! License lifecycle per plugin:
//! `Uninstalled -> PaymentPending -> Active -> {Expired | Revoked | UsageExhausted}`
//!
//! Offline execution is bounded by a cached license's expiry and its usage
//! ceiling. Usage counts only go up and are persisted on every increment, so
//! restarting the host does not reset them.

mod issuer;
mod manager;
mod payment;
mod policy;

pub use issuer::{Ed25519LicenseIssuer, LicenseIssuer, LicenseRequest};
pub use manager::{InstallOptions, InstallResult, LicenseManager, LicenseState};
pub use payment::{
    PaymentDetails, PaymentProcessor, PaymentReceipt, PaymentRequest, TransactionRecord,
    TransactionStatus,
};
pub use policy::MonetizationPolicy;
