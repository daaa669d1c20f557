//! Sink, filter and overwrite hooks supplied by the writer's owner

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::SinkError;

/// Filter run on the coordinator for every received record.
/// Returning `false` drops the record before it is buffered.
pub type InstancePreprocessor<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Called on the coordinator each time an insert overwrites an unprocessed record
pub type OverwriteCallback = Box<dyn Fn() + Send + Sync>;

/// Destination for batches drained from the writer.
///
/// `send` should not return until the batch has been handled or has failed.
/// The slice is only valid for the duration of the call; its backing storage
/// is reused for later batches. The token is the writer's own cancellation
/// token, and honoring it is up to the implementation.
#[async_trait]
pub trait InstanceSink<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Send one batch
    async fn send(&self, cancel: CancellationToken, batch: &[T]) -> Result<(), SinkError>;
}

#[async_trait]
impl<T, S> InstanceSink<T> for Arc<S>
where
    T: Send + Sync + 'static,
    S: InstanceSink<T> + ?Sized,
{
    async fn send(&self, cancel: CancellationToken, batch: &[T]) -> Result<(), SinkError> {
        (**self).send(cancel, batch).await
    }
}
