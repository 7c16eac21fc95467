//! Asynchronous utilities for use with Tokio.
//!
//! The pipeline is built from boxed futures and streams flowing through
//! bounded queues. These aliases keep the signatures readable.

use std::pin::Pin;

use futures::Stream;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A boxed, sendable future.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A boxed, sendable stream.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// A handle for a background worker. Await [`JoinWorker::join`] to wait for
/// it to drain and to collect any error it returned.
pub struct JoinWorker {
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Wrap a Tokio [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move {
                handle.await.context("could not join worker task")?
            }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}
