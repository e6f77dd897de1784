//! Recipient record, identity fields, and resolution request types.

use serde::{Deserialize, Serialize};

use crate::types::{Aci, Pni, RecipientId, ServiceId};

/// Fully materialized, authoritative recipient row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRecord {
    /// Stable recipient identifier.
    pub id: RecipientId,
    /// Phone number in E164 format.
    pub e164: Option<String>,
    /// Phone-number identifier column.
    pub pni: Option<Pni>,
    /// Addressing identifier: the ACI when known, else the PNI.
    pub service_id: Option<ServiceId>,
    /// True when the current PNI association was cryptographically verified.
    pub pni_verified: bool,
    /// True when the user blocked this recipient.
    pub blocked: bool,
}

impl RecipientRecord {
    /// Creates a record from a set of identifiers.
    pub fn new(id: RecipientId, fields: &IdentityFields, pni_verified: bool) -> Self {
        let mut rec = Self {
            id,
            e164: fields.e164.clone(),
            pni: None,
            service_id: None,
            pni_verified: false,
            blocked: false,
        };
        if let Some(aci) = fields.aci {
            rec.set_aci(aci);
        }
        if let Some(pni) = fields.pni {
            rec.set_pni(pni);
            rec.pni_verified = pni_verified;
        }
        rec
    }

    /// The account identifier, present iff `service_id` is ACI-typed.
    pub fn aci(&self) -> Option<Aci> {
        self.service_id.and_then(ServiceId::aci)
    }

    /// Identifier triple currently held by this record.
    pub fn fields(&self) -> IdentityFields {
        IdentityFields {
            e164: self.e164.clone(),
            pni: self.pni,
            aci: self.aci(),
        }
    }

    /// Sets the PNI column, promoting it to `service_id` when no ACI is known.
    pub fn set_pni(&mut self, pni: Pni) {
        self.pni = Some(pni);
        if self.aci().is_none() {
            self.service_id = Some(ServiceId::Pni(pni));
        }
    }

    /// Clears the PNI column along with a PNI-typed `service_id`.
    pub fn clear_pni(&mut self) {
        self.pni = None;
        self.pni_verified = false;
        if matches!(self.service_id, Some(ServiceId::Pni(_))) {
            self.service_id = None;
        }
    }

    /// Sets the ACI, which always becomes the `service_id`.
    pub fn set_aci(&mut self, aci: Aci) {
        self.service_id = Some(ServiceId::Aci(aci));
    }

    /// True when the record holds no identifier at all.
    pub fn is_empty(&self) -> bool {
        self.e164.is_none() && self.pni.is_none() && self.service_id.is_none()
    }
}

/// The three identifiers a recipient may be addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityFields {
    /// Phone number.
    pub e164: Option<String>,
    /// Phone-number identifier.
    pub pni: Option<Pni>,
    /// Account identifier.
    pub aci: Option<Aci>,
}

impl IdentityFields {
    /// True when only a PNI is present.
    pub fn pni_only(&self) -> bool {
        self.pni.is_some() && self.e164.is_none() && self.aci.is_none()
    }

    /// True when no identifier is present.
    pub fn is_empty(&self) -> bool {
        self.e164.is_none() && self.pni.is_none() && self.aci.is_none()
    }
}

/// An observed `(e164?, pni?, aci?)` tuple plus resolution flags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Observed phone number.
    pub e164: Option<String>,
    /// Observed phone-number identifier.
    pub pni: Option<Pni>,
    /// Observed account identifier.
    pub aci: Option<Aci>,
    /// The PNI association was proven by a signature.
    pub pni_verified: bool,
    /// Allow changes to the local user's own e164.
    pub change_self: bool,
}

impl ResolveRequest {
    /// Builds an unverified request that will not touch the local e164.
    pub fn new(e164: Option<&str>, pni: Option<Pni>, aci: Option<Aci>) -> Self {
        Self {
            e164: e164.map(str::to_string),
            pni,
            aci,
            pni_verified: false,
            change_self: false,
        }
    }

    /// Marks the PNI association as verified.
    pub fn with_pni_verified(mut self, verified: bool) -> Self {
        self.pni_verified = verified;
        self
    }

    /// Allows this request to change the local user's e164.
    pub fn with_change_self(mut self, change_self: bool) -> Self {
        self.change_self = change_self;
        self
    }

    /// Identifier triple carried by the request.
    pub fn fields(&self) -> IdentityFields {
        IdentityFields {
            e164: self.e164.clone(),
            pni: self.pni,
            aci: self.aci,
        }
    }
}
