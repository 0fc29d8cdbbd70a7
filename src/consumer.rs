use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use tracing::{error, info, warn};

use crate::domain::Job;
use crate::error::KiraError;
use crate::pipeline::JobHandler;

#[async_trait]
pub trait InboundMessage: Send + Sync {
    fn payload(&self) -> &[u8];

    async fn ack(&self) -> Result<(), KiraError>;

    async fn reject(&self, requeue: bool) -> Result<(), KiraError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

#[derive(Clone)]
pub struct QueueConsumer {
    handler: Arc<dyn JobHandler>,
    prefetch: usize,
}

impl QueueConsumer {
    pub fn new(handler: Arc<dyn JobHandler>, prefetch: usize) -> Self {
        Self {
            handler,
            prefetch: prefetch.max(1),
        }
    }

    /// Unparseable payloads are dropped; failed or panicking jobs go back to
    /// the queue.
    pub async fn dispose(&self, payload: &[u8]) -> Disposition {
        let job = match Job::from_json(payload) {
            Ok(job) => job,
            Err(err) => {
                warn!(
                    error = %err,
                    payload = %String::from_utf8_lossy(payload),
                    "failed to parse message content, discarding"
                );
                return Disposition::Reject { requeue: false };
            }
        };

        match AssertUnwindSafe(self.handler.handle(&job))
            .catch_unwind()
            .await
        {
            Ok(Ok(report)) => {
                info!(manifest_id = %report.manifest_id, "message processed");
                Disposition::Ack
            }
            Ok(Err(failure)) => {
                warn!(
                    manifest_id = %failure.manifest_id,
                    stage = %failure.stage,
                    error = %failure.error,
                    "job failed, requeueing message"
                );
                Disposition::Reject { requeue: true }
            }
            Err(_) => {
                error!(manifest_id = %job.manifest_id, "job handler panicked, requeueing message");
                Disposition::Reject { requeue: true }
            }
        }
    }

    pub async fn process<M: InboundMessage>(&self, message: M) -> Disposition {
        let disposition = self.dispose(message.payload()).await;
        let settled = match disposition {
            Disposition::Ack => message.ack().await,
            Disposition::Reject { requeue } => message.reject(requeue).await,
        };
        if let Err(err) = settled {
            error!(error = %err, ?disposition, "failed to settle message");
        }
        disposition
    }

    pub async fn run<S, M>(&self, deliveries: S)
    where
        S: Stream<Item = Result<M, KiraError>>,
        M: InboundMessage,
    {
        deliveries
            .for_each_concurrent(self.prefetch, |delivery| async move {
                match delivery {
                    Ok(message) => {
                        self.process(message).await;
                    }
                    Err(err) => warn!(error = %err, "broken delivery, skipping"),
                }
            })
            .await;
        info!("delivery stream closed");
    }
}
