// Request dispatcher
//
// Turns one inbound JSON request into one response: parse, validate, then
// either run the handler on a blocking worker or park it in the stop queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info};
use voltron_adaptor::Adaptor;

use crate::handlers::{self, HandlerContext};
use crate::protocol::{ApiError, ApiResponse, ApiResult, RequestEnvelope};
use crate::queue::StopQueue;
use crate::requests::{Request, RequestKind};

struct Shared {
    adaptor: RwLock<Option<Arc<dyn Adaptor>>>,
    queue: StopQueue,
    running: AtomicBool,
    default_timeout: Duration,
    hosts: Vec<String>,
    views: Vec<String>,
}

/// Cheap to clone; every listener task holds one
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(default_timeout: Duration, hosts: Vec<String>, views: Vec<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                adaptor: RwLock::new(None),
                queue: StopQueue::new(),
                running: AtomicBool::new(false),
                default_timeout,
                hosts,
                views,
            }),
        }
    }

    pub fn bind(&self, adaptor: Arc<dyn Adaptor>) {
        info!("Binding {} adaptor", adaptor.host());
        *self.shared.adaptor.write().unwrap_or_else(PoisonError::into_inner) = Some(adaptor);
    }

    pub fn unbind(&self) -> Option<Arc<dyn Adaptor>> {
        self.shared
            .adaptor
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn adaptor(&self) -> Option<Arc<dyn Adaptor>> {
        self.shared
            .adaptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start accepting requests
    pub fn start(&self) {
        self.shared.queue.open();
        self.shared.running.store(true, Ordering::SeqCst);
    }

    /// Stop accepting requests and cancel everything parked. Returns the
    /// number of cancelled requests.
    pub fn stop(&self) -> usize {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.queue.cancel()
    }

    /// Cancel everything parked while continuing to accept requests
    pub fn cancel(&self) -> usize {
        self.shared.queue.cancel_pending()
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Run every parked request on the calling thread. Called from the
    /// debugger's stop-hook.
    pub fn drain(&self) -> usize {
        let adaptor = self.adaptor();
        let shared = &self.shared;

        shared.queue.drain(|request, timeout| match &adaptor {
            Some(adaptor) => {
                let ctx = HandlerContext {
                    adaptor: adaptor.as_ref(),
                    hosts: &shared.hosts,
                    views: &shared.views,
                    timeout,
                };
                handlers::handle(request, &ctx)
            }
            None => ApiError::DebuggerNotPresent.into(),
        })
    }

    /// Dispatch a raw request body
    pub async fn dispatch_json(&self, body: &[u8]) -> ApiResponse {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => self.dispatch_value(value).await,
            Err(e) => {
                debug!("Unparseable request body: {}", e);
                ApiError::InvalidRequest(e.to_string()).into()
            }
        }
    }

    pub async fn dispatch_value(&self, value: Value) -> ApiResponse {
        match self.dispatch(value).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request rejected: {}", e);
                e.into()
            }
        }
    }

    async fn dispatch(&self, value: Value) -> ApiResult<ApiResponse> {
        if !self.is_running() {
            return Err(ApiError::ServerNotRunning);
        }

        let envelope: RequestEnvelope = serde_json::from_value(value)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        if envelope.message_type != "request" {
            return Err(ApiError::InvalidRequest(format!(
                "Expected a request, got {}",
                envelope.message_type
            )));
        }

        let kind = RequestKind::from_name(&envelope.request)
            .ok_or_else(|| ApiError::UnknownRequest(envelope.request.clone()))?;
        let request = Request::parse(kind, envelope.data)?;
        request.validate()?;

        let adaptor = self.adaptor().ok_or(ApiError::DebuggerNotPresent)?;

        let timeout = match envelope.timeout {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|_| ApiError::InvalidRequest(format!("Bad timeout: {}", secs)))?,
            None => self.shared.default_timeout,
        };

        // `wait` already waits for the next stop itself
        if envelope.block && kind != RequestKind::Wait {
            return Ok(self.shared.queue.park(request, timeout).await);
        }

        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let ctx = HandlerContext {
                adaptor: adaptor.as_ref(),
                hosts: &shared.hosts,
                views: &shared.views,
                timeout,
            };
            handlers::handle(&request, &ctx)
        })
        .await
        .map_err(|e| {
            error!("Handler task failed: {}", e);
            ApiError::Generic(format!("Handler failed: {}", e))
        })
    }
}
