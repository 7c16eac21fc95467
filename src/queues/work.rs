//! Async item processing with backpressure.
//!
//! We limit the number of work items that may be in flight at any one time.
//! Once that limit is reached, submitting another item waits until one of the
//! in-flight items completes. See ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html) for the idea.
//!
//! This is strictly an in-process queue for closely related subtasks of one
//! larger task. It does not handle priorities or fairness.

use std::sync::Arc;

use futures::{
    FutureExt as _, SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
};

use crate::{
    async_utils::{BoxedFuture, BoxedStream, JoinWorker},
    prelude::*,
};

/// An input plus the channel on which to return its output.
struct WorkItem<Input, Output> {
    input: Input,
    tx: oneshot::Sender<Output>,
}

/// An async work function.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Output> + Send + Sync + 'static>;

/// A queue that runs at most `concurrency_limit` calls of its work function at
/// once.
pub struct WorkQueue<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Spawn the worker for a new queue.
    ///
    /// Up to `concurrency_limit` items may be waiting in the channel while
    /// another `concurrency_limit` are being processed.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<Input, Output>,
    ) -> (Self, JoinWorker) {
        let concurrency_limit = concurrency_limit.max(1);
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |item: WorkItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    let output = work_fn(item.input).await;
                    if item.tx.send(output).is_err() {
                        debug!("work item receiver was dropped before completion");
                    }
                }
            })
            .await;
            Ok(())
        });
        (Self { tx }, JoinWorker::from_handle(worker))
    }

    /// Get a handle for submitting items.
    pub fn handle(&self) -> WorkQueueHandle<Input, Output> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}

/// A cheap, cloneable handle to a [`WorkQueue`].
pub struct WorkQueueHandle<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

// Written by hand so that `Input` and `Output` need not be `Clone`.
impl<Input, Output> Clone for WorkQueueHandle<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Input, Output> WorkQueueHandle<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Submit an input and wait for its output. Blocks while the queue is
    /// full.
    pub async fn process(&self, input: Input) -> Result<Output> {
        let (tx, rx) = oneshot::channel();
        let mut sender = self.tx.clone();
        sender
            .send(WorkItem { input, tx })
            .await
            .context("failed to submit work item")?;
        rx.await.context("work queue dropped a work item")
    }

    /// Turn a stream of inputs into a stream of futures yielding outputs.
    /// Resolve them with [`StreamExt::buffer_unordered`]. The queue's own
    /// concurrency limit still applies, whatever buffer size you pick.
    pub fn process_stream(
        &self,
        inputs: BoxedStream<Input>,
    ) -> BoxedStream<BoxedFuture<Result<Output>>> {
        let handle = self.clone();
        inputs
            .map(move |input| {
                let handle = handle.clone();
                async move { handle.process(input).await }.boxed()
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::stream;

    use super::*;

    #[tokio::test]
    async fn never_exceeds_concurrency_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work_fn: WorkFn<usize, usize> = {
            let active = active.clone();
            let peak = peak.clone();
            Arc::new(move |n| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    n * 2
                }
                .boxed()
            })
        };

        let (queue, worker) = WorkQueue::new(3, work_fn);
        let outputs = queue
            .handle()
            .process_stream(stream::iter(0..20).boxed())
            .buffer_unordered(16)
            .collect::<Vec<_>>()
            .await;
        drop(queue);
        worker.join().await.unwrap();

        let mut outputs = outputs
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        outputs.sort();
        assert_eq!(outputs, (0..20).map(|n| n * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
