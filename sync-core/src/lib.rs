//! Local-first synchronization core for huddle clients.
//!
//! Keeps four collaborative domains (inbox, scope windows, timeline overrides
//! and the task-order overlay) consistent across a durable local cache, the
//! authoritative remote store and a push channel announcing remote changes.
//!
//! - [`domain`]: load/save merge protocol shared by the synchronized domains.
//! - [`ordering`]: manual task order reconciled against server task lists.
//! - [`task_board`]: in-memory task mirrors and guarded task refresh.
//! - [`optimistic`]: apply, confirm, roll back.
//! - [`bridge`]: push notifications in, guarded reloads out.
//! - [`lifecycle`]: scope completion and the weekly scope.
//! - [`engine`]: wires all of the above for one client.

mod activation;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod domain;
pub mod engine;
pub mod lifecycle;
pub mod model;
pub mod optimistic;
pub mod ordering;
pub mod remote;
pub mod task_board;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use engine::SyncEngine;
pub use remote::RemoteError;
pub use remote::RemoteStore;
