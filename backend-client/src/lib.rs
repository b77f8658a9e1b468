//! HTTP backend for the huddle sync core.
//!
//! [`HttpRemoteStore`] talks to the REST endpoints of the authoritative store;
//! [`SsePushChannel`] receives change notifications as server-sent events and
//! publishes broadcasts with a plain POST.

mod backend;
mod remote;
mod sse;

pub use backend::Backend;
pub use backend::ClientError;
pub use remote::HttpRemoteStore;
pub use sse::SsePushChannel;
