//! Conversation threads, messages, and synthetic conversation events.

use serde::{Deserialize, Serialize};

use crate::types::{MessageId, RecipientId, ThreadId};

/// One-to-one conversation owned by a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    /// Thread identifier.
    pub id: ThreadId,
    /// Recipient the thread is with.
    pub recipient_id: RecipientId,
}

/// Message payload, either user content or an event inserted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Regular text message.
    Text(String),
    /// The recipient's phone number changed.
    ChangeNumber {
        /// Previous number.
        old_e164: String,
        /// Current number.
        new_e164: String,
    },
    /// Messages are now exchanged under a different session.
    SessionSwitchover {
        /// Phone number shown with the event.
        e164: Option<String>,
    },
    /// Two threads with this recipient were folded together.
    ThreadMerge {
        /// Number of the absorbed recipient, when it had one.
        previous_e164: Option<String>,
    },
}

/// A message or event within a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message identifier.
    pub id: MessageId,
    /// Containing thread.
    pub thread_id: ThreadId,
    /// Sender or subject recipient.
    pub author: RecipientId,
    /// Send timestamp in milliseconds; defines thread order together with `id`.
    pub sent_ms: u64,
    /// Content.
    pub body: MessageBody,
}

/// Insert payload for a [`MessageRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Containing thread.
    pub thread_id: ThreadId,
    /// Sender recipient.
    pub author: RecipientId,
    /// Send timestamp in milliseconds.
    pub sent_ms: u64,
    /// Content.
    pub body: MessageBody,
}
