//! Cost window service implementation.

use std::sync::Arc;
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument};

use super::proto::costwindow::v1::{
    cost_window_service_server::CostWindowService, CheckCapacityRequest, CheckCapacityResponse,
    ConsumerState, FlushRequest, FlushResponse, GetConsumerStateRequest, RecordCostRequest,
    RecordCostResponse,
};

use crate::error::CostWindowError;
use crate::ratelimit::{ConsumerScope, RateLimitState, RateLimiter};

/// Metadata key naming the consumer whose limit denied a request.
pub const RATE_LIMIT_SCOPE_HEADER: &str = "x-ratelimit-scope";

/// Implementation of the CostWindowService gRPC interface.
pub struct CostWindowServiceImpl {
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
}

impl CostWindowServiceImpl {
    /// Create a new CostWindowServiceImpl with the given rate limiter.
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        Self { rate_limiter }
    }
}

fn client_id(id: &str) -> Option<&str> {
    (!id.is_empty()).then_some(id)
}

fn internal(err: CostWindowError) -> Status {
    error!(error = %err, "Rate limiter failure");
    Status::internal(err.to_string())
}

/// The rate-limit response returned to callers.
fn too_many_requests(scope: &ConsumerScope) -> Status {
    let mut status = Status::resource_exhausted("Too many requests");
    status
        .metadata_mut()
        .insert(RATE_LIMIT_SCOPE_HEADER, MetadataValue::from_static(scope.kind()));
    status
}

impl From<RateLimitState> for ConsumerState {
    fn from(state: RateLimitState) -> Self {
        Self {
            scope: state.scope.to_string(),
            prev_window_value: state.prev_window_value,
            current_window_value: state.current_window_value,
            current_window_reset_time: state.current_window_reset_time,
            current_limit: state.current_limit,
            time_created: state.time_created,
        }
    }
}

#[tonic::async_trait]
impl CostWindowService for CostWindowServiceImpl {
    /// Decide whether a request of the given cost may proceed.
    #[instrument(
        skip(self, request),
        fields(
            client_id = %request.get_ref().client_id,
            cost = request.get_ref().cost
        )
    )]
    async fn check_capacity(
        &self,
        request: Request<CheckCapacityRequest>,
    ) -> Result<Response<CheckCapacityResponse>, Status> {
        let req = request.into_inner();

        let decision = self
            .rate_limiter
            .check(client_id(&req.client_id), req.cost, None)
            .await
            .map_err(internal)?;

        if !decision.allowed {
            let scope = decision.denied_by.unwrap_or(ConsumerScope::Global);
            info!(
                client_id = %req.client_id,
                scope = %scope,
                cost = req.cost,
                "Request rate limited"
            );
            return Err(too_many_requests(&scope));
        }

        debug!(client_id = %req.client_id, cost = req.cost, "Request admitted");

        Ok(Response::new(CheckCapacityResponse {
            allowed: true,
            duration_until_reset: Some(prost_types::Duration {
                seconds: decision.duration_until_reset,
                nanos: 0,
            }),
        }))
    }

    /// Charge cost for completed (or aborted) work.
    #[instrument(
        skip(self, request),
        fields(
            client_id = %request.get_ref().client_id,
            cost = request.get_ref().cost,
            flush = request.get_ref().flush
        )
    )]
    async fn record_cost(
        &self,
        request: Request<RecordCostRequest>,
    ) -> Result<Response<RecordCostResponse>, Status> {
        let req = request.into_inner();
        let client_id = client_id(&req.client_id);

        let flushed = if req.flush {
            self.rate_limiter
                .record_now(client_id, req.cost)
                .await
                .map_err(internal)?
        } else {
            self.rate_limiter
                .record(client_id, req.cost, None)
                .await
                .map_err(internal)?
        };

        Ok(Response::new(RecordCostResponse { flushed }))
    }

    async fn get_consumer_state(
        &self,
        request: Request<GetConsumerStateRequest>,
    ) -> Result<Response<ConsumerState>, Status> {
        let req = request.into_inner();
        let scope = ConsumerScope::from_client_id(Some(&req.client_id));

        let state = self.rate_limiter.state(scope).await.map_err(internal)?;
        Ok(Response::new(state.into()))
    }

    async fn flush(&self, _request: Request<FlushRequest>) -> Result<Response<FlushResponse>, Status> {
        let flushed = self.rate_limiter.flush_all().await.map_err(internal)?;
        debug!(consumers = flushed, "Flushed pending cost");

        Ok(Response::new(FlushResponse {
            consumers_flushed: u32::try_from(flushed).unwrap_or(u32::MAX),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LimitSettings;
    use crate::store::MemoryStore;

    fn service(settings: LimitSettings) -> CostWindowServiceImpl {
        let store = Arc::new(MemoryStore::new());
        CostWindowServiceImpl::new(Arc::new(RateLimiter::new(store, settings)))
    }

    fn check(client_id: &str, cost: u64) -> Request<CheckCapacityRequest> {
        Request::new(CheckCapacityRequest {
            client_id: client_id.to_string(),
            cost,
        })
    }

    #[tokio::test]
    async fn test_valid_request_is_admitted() {
        let service = service(LimitSettings::unlimited());

        let response = service.check_capacity(check("abc", 10)).await.unwrap().into_inner();
        assert!(response.allowed);
        assert_eq!(response.duration_until_reset.unwrap().seconds, 60);
    }

    #[tokio::test]
    async fn test_denied_request_is_resource_exhausted() {
        let settings = LimitSettings::unlimited().with_client_limit("abc", Some(100));
        let service = service(settings);

        let status = service.check_capacity(check("abc", 150)).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(status.message(), "Too many requests");
        assert_eq!(
            status.metadata().get(RATE_LIMIT_SCOPE_HEADER).unwrap().to_str().unwrap(),
            "client"
        );

        // Anonymous traffic has no client limit
        assert!(service.check_capacity(check("", 150)).await.is_ok());
    }

    #[tokio::test]
    async fn test_site_limit_denial_names_global() {
        let settings = LimitSettings {
            site_rate_limit: Some(5),
            ..Default::default()
        };
        let service = service(settings);

        let status = service.check_capacity(check("", 6)).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(
            status.metadata().get(RATE_LIMIT_SCOPE_HEADER).unwrap().to_str().unwrap(),
            "global"
        );
    }

    #[tokio::test]
    async fn test_record_and_read_state() {
        let service = service(LimitSettings::unlimited().with_client_limit("abc", Some(100)));
        service.check_capacity(check("abc", 1)).await.unwrap();

        let response = service
            .record_cost(Request::new(RecordCostRequest {
                client_id: "abc".to_string(),
                cost: 25,
                flush: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.flushed);

        let state = service
            .get_consumer_state(Request::new(GetConsumerStateRequest {
                client_id: "abc".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(state.scope, "client:abc");
        assert_eq!(state.current_window_value, 25);
        assert_eq!(state.current_limit, Some(100));
        assert!(state.current_window_reset_time.is_some());

        let global = service
            .get_consumer_state(Request::new(GetConsumerStateRequest {
                client_id: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(global.scope, "global");
        assert_eq!(global.current_window_value, 25);
        assert_eq!(global.current_limit, None);
    }

    #[tokio::test]
    async fn test_forced_record_and_flush() {
        let service = service(LimitSettings::unlimited());

        let response = service
            .record_cost(Request::new(RecordCostRequest {
                client_id: String::new(),
                cost: 3,
                flush: true,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.flushed);

        let response = service
            .flush(Request::new(FlushRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.consumers_flushed, 0);
    }

    #[tokio::test]
    async fn test_forced_record_without_cost_reports_nothing_flushed() {
        let service = service(LimitSettings::unlimited());

        let response = service
            .record_cost(Request::new(RecordCostRequest {
                client_id: "abc".to_string(),
                cost: 0,
                flush: true,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.flushed);
    }
}
