//! Async coordination primitives shared by the sync core.
//!
//! - [`SingleFlight`]: at most one in-flight operation per key, with at most
//!   one trailing re-run collected from callers that arrived meanwhile.
//! - [`OrCancelExt`]: race a future against a `CancellationToken`, used to tear
//!   down push-channel listeners when the active tenant changes.

mod cancel;
mod single_flight;

pub use cancel::Cancelled;
pub use cancel::OrCancelExt;
pub use single_flight::Flight;
pub use single_flight::SingleFlight;
pub use tokio_util::sync::CancellationToken;
