//! Resolution of calling devices and the accept/reject decision for new associations.

mod cache;
mod verifier;

pub use cache::{DeviceCache, LookupError};
pub use verifier::{
	AssociationVerifier, DeviceAccessControl, RejectReason, RejectResult, RejectSource, Verdict,
};

#[cfg(test)]
pub(crate) use cache::tests;
