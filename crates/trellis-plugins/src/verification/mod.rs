//! License and provenance verification
//!
//! Three strategies decide whether a license is valid:
//! - online: proof, expiry and status-list revocation, in that order
//! - cached: expiry and the offline usage ceiling of a locally held copy
//! - offline: the license manager's predicate over the cache alone
//!
//! Source verification recomputes a plugin's source-derived identity and
//! checks the ledger and identity resolver for corroborating records.

mod collaborators;
mod engine;
mod proof;
mod status_list;
mod types;

pub use collaborators::{
    HttpStatusListFetcher, IdentityDocument, IdentityResolver, InMemoryIdentityResolver,
    LedgerClient, ProofVerifier, StatusListFetcher, VerificationKey,
};
pub use engine::{StatusCheck, VerificationEngine};
pub use proof::{ED25519_PROOF_TYPE, Ed25519ProofVerifier, Ed25519Signer};
pub use status_list::{StatusBits, StatusListCache, decode_status_list, encode_status_list};
pub use types::{
    CachedLicense, LicenseCredential, LicenseProof, LicenseStatus, LicenseType, ReleaseRecord,
    SourceVerificationRecord, SourceVerificationResult, StatusListEntry, VerificationMethod,
    VerificationResult, VerificationStage,
};
