//! Ordered remote writes.
//!
//! Every write a session originates goes through one writer task and is
//! applied in submission order, one at a time. A later write to a field can
//! never land before an earlier one.

use std::future::Future;

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub struct OrderedWriter {
    jobs: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl OrderedWriter {
    /// Start the writer task. It runs until the writer is dropped and every
    /// queued job has finished.
    pub fn spawn() -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                job.await;
            }
            debug!("writer: drained");
        });
        Self { jobs }
    }

    pub fn submit(&self, job: impl Future<Output = ()> + Send + 'static) {
        if self.jobs.send(job.boxed()).is_err() {
            warn!("writer: task gone, write dropped");
        }
    }

    /// Wait until everything submitted before this call has finished.
    pub async fn flush(&self) {
        let (done, finished) = oneshot::channel();
        self.submit(async move {
            let _ = done.send(());
        });
        let _ = finished.await;
    }
}
