//! Authoritative in-memory recipient store that resolves observed
//! `(e164, pni, aci)` tuples to one recipient id, with append-only SQLite
//! journaling.
//!
//! Resolution runs in three steps. [`core::matcher`] finds the records that
//! hold each identifier, [`core::planner`] turns them into a [`changeset::ChangeSet`]
//! without touching storage, and [`core::store::RecipientStore::apply`] applies it
//! atomically, migrating threads, messages and references on merges.
//!
//! # Examples
//!
//! In-memory usage with [`core::store::RecipientStore`]:
//! ```
//! use recipientdb::{
//!     core::store::RecipientStore,
//!     oracle::{LocalIdentity, NoSessions},
//!     recipient::ResolveRequest,
//!     types::{Aci, Pni},
//! };
//!
//! let mut store = RecipientStore::new();
//! let local = LocalIdentity::default();
//! let by_number = store
//!     .resolve(&ResolveRequest::new(Some("+15551234567"), None, None), &NoSessions, &local)
//!     .expect("resolve");
//! let full = store
//!     .resolve(
//!         &ResolveRequest::new(Some("+15551234567"), Some(Pni::from_u128(1)), Some(Aci::from_u128(2))),
//!         &NoSessions,
//!         &local,
//!     )
//!     .expect("resolve");
//! assert_eq!(by_number, full);
//! assert_eq!(store.get(full).and_then(|r| r.aci()), Some(Aci::from_u128(2)));
//! ```
//!
//! Runtime usage with SQLite sink:
//! ```no_run
//! use recipientdb::{
//!     core::store::RecipientStore,
//!     persist::sqlite::SqliteOpSink,
//!     recipient::ResolveRequest,
//!     runtime::handle::{spawn_recipientdb, RuntimeConfig},
//!     types::Aci,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! recipientdb::telemetry::init();
//! let sink = SqliteOpSink::open("recipients.db").expect("open sqlite");
//! let store = sink.load_store().expect("load");
//! let handle = spawn_recipientdb(store, Some(Box::new(sink)), RuntimeConfig::default());
//! let _id = handle
//!     .resolve(ResolveRequest::new(Some("+15551234567"), None, Some(Aci::from_u128(7))))
//!     .await
//!     .expect("resolve");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Planner output: change-sets and their operations.
pub mod changeset;
/// Threads and messages owned by recipients.
pub mod conversation;
/// Matcher, planner, references and the authoritative store.
pub mod core;
/// Journal op model and persistence wrapper types.
pub mod op;
/// Session and local-identity collaborators.
pub mod oracle;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Recipient records and resolve requests.
pub mod recipient;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Logging setup.
pub mod telemetry;
/// Shared identifier types.
pub mod types;
