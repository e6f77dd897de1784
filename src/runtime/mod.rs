//! Async single-writer runtime owning a [`crate::core::store::RecipientStore`].

/// Recipient change notifications published to subscribers.
pub mod events;
/// Writer task, command handle and persistence worker.
pub mod handle;
