//! Shared primitive IDs and service identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable recipient row identifier. Never reused.
pub type RecipientId = u64;
/// Monotonic operation sequence number.
pub type OpSeq = u64;
/// Conversation thread identifier.
pub type ThreadId = u64;
/// Message (or synthetic event) identifier.
pub type MessageId = u64;
/// Row identifier inside a dependent reference table.
pub type RowId = u64;

/// Stable account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Aci(pub Uuid);

/// Rotating phone-number identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pni(pub Uuid);

impl Aci {
    /// Builds an ACI from its raw 128-bit value.
    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl Pni {
    /// Builds a PNI from its raw 128-bit value.
    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl fmt::Display for Aci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Pni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PNI:{}", self.0)
    }
}

/// Identifier used for protocol addressing: the ACI when known, else the PNI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceId {
    /// Account identifier.
    Aci(Aci),
    /// Phone-number identifier.
    Pni(Pni),
}

impl ServiceId {
    /// Returns the ACI when this is an ACI-typed value.
    pub fn aci(self) -> Option<Aci> {
        match self {
            ServiceId::Aci(aci) => Some(aci),
            ServiceId::Pni(_) => None,
        }
    }

    /// Returns the PNI when this is a PNI-typed value.
    pub fn pni(self) -> Option<Pni> {
        match self {
            ServiceId::Aci(_) => None,
            ServiceId::Pni(pni) => Some(pni),
        }
    }
}

impl From<Aci> for ServiceId {
    fn from(value: Aci) -> Self {
        ServiceId::Aci(value)
    }
}

impl From<Pni> for ServiceId {
    fn from(value: Pni) -> Self {
        ServiceId::Pni(value)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::Aci(aci) => aci.fmt(f),
            ServiceId::Pni(pni) => pni.fmt(f),
        }
    }
}
