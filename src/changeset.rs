//! Declarative output of the tuple resolution planner.
//!
//! A [`ChangeSet`] is built fresh for every resolution, consumed once by the
//! store's applier, and journaled verbatim so replay never re-plans.

use serde::{Deserialize, Serialize};

use crate::{
    recipient::IdentityFields,
    types::{Aci, Pni, RecipientId},
};

/// Record that survives once the change-set is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSetTarget {
    /// Nothing matched; a new record must be created with these fields.
    Insert(IdentityFields),
    /// An existing record is the final survivor.
    Existing(RecipientId),
}

/// One step of a change-set. Applied strictly in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PnpOperation {
    /// Assign an e164 to a surviving record.
    SetE164 {
        /// Record to mutate.
        id: RecipientId,
        /// New phone number.
        e164: String,
    },
    /// Assign a PNI to a surviving record.
    SetPni {
        /// Record to mutate.
        id: RecipientId,
        /// New PNI.
        pni: Pni,
    },
    /// Assign an ACI to a record that had none.
    SetAci {
        /// Record to mutate.
        id: RecipientId,
        /// New ACI.
        aci: Aci,
    },
    /// Clear an e164 that is being stolen.
    RemoveE164 {
        /// Record losing its e164.
        id: RecipientId,
    },
    /// Clear a PNI that is being stolen.
    RemovePni {
        /// Record losing its PNI.
        id: RecipientId,
    },
    /// Absorb `secondary` into `primary` and delete `secondary`.
    Merge {
        /// Survivor of the merge.
        primary: RecipientId,
        /// Record folded away.
        secondary: RecipientId,
    },
    /// A known-ACI record's phone number changed.
    ChangeNumberNotice {
        /// Record whose number changed.
        id: RecipientId,
        /// Previous number.
        old_e164: String,
        /// Current number.
        new_e164: String,
    },
    /// A record's PNI changed while a session existed for the old PNI.
    SessionSwitchoverNotice {
        /// Record that switched sessions.
        id: RecipientId,
        /// Phone number to show in the event, when known.
        e164: Option<String>,
    },
}

/// Immutable, inspectable, replayable plan for one observed tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Final survivor.
    pub target: ChangeSetTarget,
    /// Ordered operations.
    pub operations: Vec<PnpOperation>,
}

impl ChangeSet {
    /// A change-set that creates a fresh record.
    pub fn insert(fields: IdentityFields) -> Self {
        Self {
            target: ChangeSetTarget::Insert(fields),
            operations: Vec::new(),
        }
    }

    /// True when applying this change-set would not touch storage.
    pub fn is_noop(&self) -> bool {
        matches!(self.target, ChangeSetTarget::Existing(_)) && self.operations.is_empty()
    }

    /// Secondaries of every merge, in order.
    pub fn merged_away(&self) -> Vec<RecipientId> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                PnpOperation::Merge { secondary, .. } => Some(*secondary),
                _ => None,
            })
            .collect()
    }
}
