use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{PosClient, TenantResolver};

/// Durable work handed off by the webhook receivers. Delivery is at least
/// once; handlers key on deterministic identifiers so replays are harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    SubmitOrder {
        tenant_id: String,
        order_id: String,
    },
    CallEnded {
        tenant_id: String,
        call_id: String,
        payload: Value,
    },
    SyncCatalog {
        tenant_id: String,
    },
}

pub type JobSender = mpsc::UnboundedSender<Job>;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<()>;
}

pub struct JobQueueBuilder {
    cancel_token: Option<CancellationToken>,
    max_concurrent: usize,
    handler: Option<Arc<dyn JobHandler>>,
}

impl JobQueueBuilder {
    pub fn new() -> Self {
        Self {
            cancel_token: None,
            max_concurrent: 8,
            handler: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> JobQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        JobQueue {
            sender,
            receiver,
            cancel_token: self.cancel_token.unwrap_or_default(),
            max_concurrent: self.max_concurrent,
            handler: self.handler.expect("job handler is required"),
        }
    }
}

impl Default for JobQueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct JobQueue {
    pub sender: JobSender,
    receiver: mpsc::UnboundedReceiver<Job>,
    cancel_token: CancellationToken,
    max_concurrent: usize,
    handler: Arc<dyn JobHandler>,
}

impl JobQueue {
    pub async fn serve(&mut self) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        loop {
            let job = select! {
                _ = self.cancel_token.cancelled() => break,
                job = self.receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let handler = self.handler.clone();
            crate::spawn(async move {
                let _permit = permit;
                if let Err(e) = handler.handle(job.clone()).await {
                    warn!("job failed: {:#} {:?}", e, job);
                }
            });
        }
        debug!("job queue stopped");
    }
}

/// Production handler: submits orders to the POS, refreshes menu caches and
/// relays finished-call payloads.
pub struct GatewayJobHandler {
    pos: Option<Arc<PosClient>>,
    resolver: Arc<dyn TenantResolver>,
    call_events_url: Option<String>,
    client: Client,
}

impl GatewayJobHandler {
    pub fn new(
        pos: Option<Arc<PosClient>>,
        resolver: Arc<dyn TenantResolver>,
        call_events_url: Option<String>,
    ) -> Self {
        Self {
            pos,
            resolver,
            call_events_url,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl JobHandler for GatewayJobHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        match job {
            Job::SubmitOrder {
                tenant_id,
                order_id,
            } => {
                let Some(pos) = self.pos.as_ref() else {
                    warn!(tenant_id, order_id, "no POS configured, order not submitted");
                    return Ok(());
                };
                pos.submit_order(&tenant_id, &order_id).await?;
                info!(tenant_id, order_id, "order submitted to POS");
                Ok(())
            }
            Job::SyncCatalog { tenant_id } => {
                let Some(pos) = self.pos.as_ref() else {
                    warn!(tenant_id, "no POS configured, catalog not synced");
                    return Ok(());
                };
                pos.sync_catalog(self.resolver.as_ref(), &tenant_id).await?;
                Ok(())
            }
            Job::CallEnded {
                tenant_id,
                call_id,
                payload,
            } => {
                let Some(url) = self.call_events_url.as_ref() else {
                    info!(tenant_id, call_id, "call ended");
                    return Ok(());
                };
                let res = self.client.post(url).json(&payload).send().await?;
                if !res.status().is_success() {
                    return Err(anyhow::anyhow!("call event relay failed: {}", res.status()));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingHandler {
        handled: Arc<Mutex<Vec<Job>>>,
        fail_first: Mutex<bool>,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: Job) -> Result<()> {
            let fail = {
                let mut flag = self.fail_first.lock().unwrap();
                std::mem::replace(&mut *flag, false)
            };
            self.handled.lock().unwrap().push(job);
            if fail {
                return Err(anyhow::anyhow!("scripted failure"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn jobs_flow_through_and_failures_do_not_stop_the_queue() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler {
            handled: handled.clone(),
            fail_first: Mutex::new(true),
        });
        let token = CancellationToken::new();
        let mut queue = JobQueueBuilder::new()
            .with_cancel_token(token.clone())
            .with_max_concurrent(2)
            .with_handler(handler)
            .build();
        let sender = queue.sender.clone();
        let worker = crate::spawn(async move { queue.serve().await });

        sender
            .send(Job::SyncCatalog {
                tenant_id: "t-1".to_string(),
            })
            .unwrap();
        sender
            .send(Job::SubmitOrder {
                tenant_id: "t-1".to_string(),
                order_id: "o-1".to_string(),
            })
            .unwrap();

        for _ in 0..100 {
            if handled.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handled.lock().unwrap().len(), 2);

        token.cancel();
        worker.await.unwrap();
    }
}
