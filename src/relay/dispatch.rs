use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{ForwardError, TunnelDisconnect};
use crate::tunnel::TunnelSession;

use super::request::{ForwardResponse, ForwardResult, InboundRequest};
use super::target::TargetClient;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 100;
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Cap on concurrently forwarded requests
    pub max_in_flight: usize,
    /// How long in-flight forwards may finish after shutdown starts
    pub drain_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

/// Bridges inbound requests to the target, one task per request.
///
/// Cheap to clone; clones share the connection pool, the in-flight limit
/// and the task tracker.
#[derive(Clone)]
pub struct RequestRelay {
    client: Arc<TargetClient>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    abort: CancellationToken,
    drain_grace: Duration,
}

impl RequestRelay {
    pub fn new(client: TargetClient, config: &RelayConfig) -> Self {
        Self {
            client: Arc::new(client),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            tasks: TaskTracker::new(),
            abort: CancellationToken::new(),
            drain_grace: config.drain_grace,
        }
    }

    /// Consume the session's inbound requests until it ends.
    ///
    /// Returns the disconnect if the tunnel was lost rather than closed.
    pub async fn run(&self, session: &mut TunnelSession) -> Result<(), TunnelDisconnect> {
        while let Some(event) = session.next_request().await {
            match event {
                Ok(request) => self.dispatch(request).await,
                Err(disconnect) => return Err(disconnect),
            }
        }
        Ok(())
    }

    /// Spawn the forward for one request. Waits for a free slot first, so a
    /// saturated relay stops pulling new requests.
    pub async fn dispatch(&self, request: InboundRequest) {
        info!("🔗 New request: {} {}", request.method, request.path);

        if self.tasks.is_closed() {
            request.respond(shutting_down());
            return;
        }

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                request.respond(shutting_down());
                return;
            }
        };

        let client = self.client.clone();
        let abort = self.abort.clone();

        self.tasks.spawn(async move {
            let _permit = permit;
            let start = Instant::now();

            let result = tokio::select! {
                result = client.forward(&request) => result,
                _ = abort.cancelled() => Err(ForwardError::Unknown(
                    "relay shut down before the target answered".to_string(),
                )),
            };

            let response = outcome_response(&request, result, start);
            request.respond(response);
        });
    }

    /// Number of forwards currently running
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting work, let in-flight forwards drain, then abort the rest
    pub async fn shutdown(&self) {
        self.tasks.close();

        if tokio::time::timeout(self.drain_grace, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "{} request(s) still in flight after {:?}, aborting",
                self.in_flight(),
                self.drain_grace
            );
            self.abort.cancel();
            self.tasks.wait().await;
        }
    }
}

fn shutting_down() -> ForwardResponse {
    ForwardResponse::from_error(&ForwardError::Unknown(
        "relay is shutting down".to_string(),
    ))
}

fn outcome_response(
    request: &InboundRequest,
    result: ForwardResult,
    start: Instant,
) -> ForwardResponse {
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(response) => {
            debug!(
                "{} {} -> {} {} bytes ({} ms)",
                request.method,
                request.path,
                response.status,
                response.body.len(),
                duration_ms
            );
            response
        }
        Err(e) => {
            warn!(
                "{} {} -> {} ({} ms)",
                request.method, request.path, e, duration_ms
            );
            ForwardResponse::from_error(&e)
        }
    }
}
