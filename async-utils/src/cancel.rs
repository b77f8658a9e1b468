use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Returned by [`OrCancelExt::or_cancel`] when the token fired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Extension trait for making futures cancellable.
///
/// A listener loop that awaits `receiver.recv().or_cancel(&token)` exits as
/// soon as the owning subscription is torn down, even when no further message
/// would ever arrive.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Race this future against the token. The token wins ties, so an
    /// already-cancelled token never lets the future's output through.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, Cancelled> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Cancelled),
            res = self => Ok(res),
        }
    }
}
