//! Matching, planning and the authoritative recipient store.

/// Errors raised by resolution and store mutations.
pub mod error;
/// Exact-match lookup of an observed tuple.
pub mod matcher;
/// Pure change-set planner.
pub mod planner;
/// Dependent tables rewired by merges.
pub mod refs;
/// Authoritative store and change-set applier.
pub mod store;
