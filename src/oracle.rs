//! Collaborators consulted by the planner.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Aci, ServiceId};

/// Failure reported by an oracle. Aborts planning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("oracle unavailable: {0}")]
pub struct OracleError(pub String);

/// Answers whether a protocol session exists for an address.
pub trait SessionOracle {
    /// True when at least one session is keyed by `service_id`.
    fn has_session(&self, service_id: ServiceId) -> Result<bool, OracleError>;
}

/// Reports the local user's own identifiers.
pub trait LocalIdentityOracle {
    /// The e164 the local user believes is theirs.
    fn local_e164(&self) -> Result<Option<String>, OracleError>;
    /// The local user's ACI.
    fn local_aci(&self) -> Result<Option<Aci>, OracleError>;
}

/// Plain value implementation of [`LocalIdentityOracle`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalIdentity {
    /// Local e164.
    pub e164: Option<String>,
    /// Local ACI.
    pub aci: Option<Aci>,
}

impl LocalIdentityOracle for LocalIdentity {
    fn local_e164(&self) -> Result<Option<String>, OracleError> {
        Ok(self.e164.clone())
    }

    fn local_aci(&self) -> Result<Option<Aci>, OracleError> {
        Ok(self.aci)
    }
}

/// Oracle that never reports a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSessions;

impl SessionOracle for NoSessions {
    fn has_session(&self, _service_id: ServiceId) -> Result<bool, OracleError> {
        Ok(false)
    }
}

impl SessionOracle for HashSet<ServiceId> {
    fn has_session(&self, service_id: ServiceId) -> Result<bool, OracleError> {
        Ok(self.contains(&service_id))
    }
}
