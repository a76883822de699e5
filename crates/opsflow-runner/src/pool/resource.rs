//! The capability every pooled resource must provide.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

/// Failure while releasing a resource's external handle.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Dispose failed: {0}")]
pub struct DisposeError(pub String);

/// A resource that can be reused after [`reset`](Recyclable::reset) and torn
/// down with [`dispose`](Recyclable::dispose).
///
/// All methods take `&self`; implementors keep their mutable state behind
/// interior mutability so the pool can hand out shared `Arc<T>` handles and
/// still find them again on release.
#[async_trait]
pub trait Recyclable: Send + Sync + 'static {
    /// Restore the default reusable state without releasing the external
    /// handle.
    fn reset(&self);

    /// Release the external handle and wait until it is gone.
    async fn dispose(&self) -> Result<(), DisposeError>;

    /// Sticky once the resource has been disposed.
    fn is_disposed(&self) -> bool;

    /// Release the external handle in the background.
    ///
    /// Failures are logged and never reach the caller.
    fn dispose_and_forget(self: Arc<Self>)
    where
        Self: Sized,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = self.dispose().await {
                        warn!(error = %e, "Background dispose failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "No async runtime available for background dispose");
            }
        }
    }
}
