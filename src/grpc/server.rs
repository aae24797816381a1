//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::costwindow::v1::cost_window_service_server::CostWindowServiceServer;
use super::service::CostWindowServiceImpl;
use crate::error::{CostWindowError, Result};
use crate::ratelimit::RateLimiter;

/// gRPC server for the cost window service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
}

impl GrpcServer {
    /// Create a new gRPC server.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self { addr, rate_limiter }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = CostWindowServiceImpl::new(self.rate_limiter);

        info!(
            addr = %self.addr,
            "Starting gRPC server for CostWindowService"
        );

        Server::builder()
            .add_service(CostWindowServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                CostWindowError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LimitSettings;
    use crate::store::MemoryStore;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let rate_limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryStore::new()),
            LimitSettings::unlimited(),
        ));
        let _server = GrpcServer::new(addr, rate_limiter);
    }
}
