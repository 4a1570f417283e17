use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::jobs::{GatewayJobHandler, JobQueueBuilder, JobSender};
use crate::llm::{GeminiClient, LlmClient};
use crate::session::ActiveSessionRef;
use crate::store::{HttpBackend, MemoryBackend, OrderStore, PosClient, TenantResolver};

/// Builds the per-session LLM client bound to a composed system prompt.
pub type FnCreateLlmClient = Arc<dyn Fn(String) -> Arc<dyn LlmClient> + Send + Sync>;

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub token: CancellationToken,
    pub resolver: Arc<dyn TenantResolver>,
    pub orders: Arc<dyn OrderStore>,
    pub pos: Option<Arc<PosClient>>,
    pub job_sender: JobSender,
    pub create_llm_client: FnCreateLlmClient,

    pub active_sessions: Arc<Mutex<HashMap<String, ActiveSessionRef>>>,
    pub total_sessions: AtomicU64,
    pub total_rejected_sessions: AtomicU64,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn stop(&self) {
        info!("stopping");
        self.token.cancel();
    }
}

impl Drop for AppStateInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Registers a session in the process-wide map for the housekeeping
/// endpoints; deregisters on drop.
pub struct SessionGuard {
    pub state: AppState,
    pub session: ActiveSessionRef,
    pub active_sessions: usize,
}

impl SessionGuard {
    pub fn new(state: AppState, session: ActiveSessionRef) -> Self {
        let active_sessions = {
            state
                .total_sessions
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let mut sessions = state.active_sessions.lock().unwrap();
            sessions.insert(session.call_id.clone(), session.clone());
            sessions.len()
        };
        Self {
            state,
            session,
            active_sessions,
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state
            .active_sessions
            .lock()
            .unwrap()
            .remove(&self.session.call_id);
    }
}

pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub cancel_token: Option<CancellationToken>,
    pub resolver: Option<Arc<dyn TenantResolver>>,
    pub orders: Option<Arc<dyn OrderStore>>,
    pub create_llm_client: Option<FnCreateLlmClient>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
            resolver: None,
            orders: None,
            create_llm_client: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TenantResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_order_store(mut self, orders: Arc<dyn OrderStore>) -> Self {
        self.orders = Some(orders);
        self
    }

    pub fn with_llm_factory(mut self, factory: FnCreateLlmClient) -> Self {
        self.create_llm_client = Some(factory);
        self
    }

    pub async fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = self.cancel_token.unwrap_or_default();

        let (resolver, orders) = if let Some(backend_config) = &config.backend {
            let backend = Arc::new(HttpBackend::new(backend_config));
            let as_resolver: Arc<dyn TenantResolver> = backend.clone();
            let as_orders: Arc<dyn OrderStore> = backend;
            (
                self.resolver.unwrap_or(as_resolver),
                self.orders.unwrap_or(as_orders),
            )
        } else {
            let memory = Arc::new(MemoryBackend::default());
            let as_resolver: Arc<dyn TenantResolver> = memory.clone();
            let as_orders: Arc<dyn OrderStore> = memory;
            if self.resolver.is_none() {
                info!("no backend configured, using the in-process store");
            }
            (
                self.resolver.unwrap_or(as_resolver),
                self.orders.unwrap_or(as_orders),
            )
        };

        let pos = config.pos.as_ref().map(|pos| Arc::new(PosClient::new(pos)));

        let handler = Arc::new(GatewayJobHandler::new(
            pos.clone(),
            resolver.clone(),
            config.call_events_url.clone(),
        ));
        let mut job_queue = JobQueueBuilder::new()
            .with_cancel_token(token.child_token())
            .with_max_concurrent(8)
            .with_handler(handler)
            .build();
        let job_sender = job_queue.sender.clone();
        crate::spawn(async move {
            job_queue.serve().await;
        });

        let create_llm_client = self.create_llm_client.unwrap_or_else(|| {
            let llm_config = config.llm.clone();
            Arc::new(move |system_prompt: String| {
                Arc::new(GeminiClient::new(&llm_config, system_prompt)) as Arc<dyn LlmClient>
            })
        });

        Ok(Arc::new(AppStateInner {
            config,
            token,
            resolver,
            orders,
            pos,
            job_sender,
            create_llm_client,
            active_sessions: Arc::new(Mutex::new(HashMap::new())),
            total_sessions: AtomicU64::new(0),
            total_rejected_sessions: AtomicU64::new(0),
        }))
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
