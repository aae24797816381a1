//! gRPC server module for the cost window service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::{CostWindowServiceImpl, RATE_LIMIT_SCOPE_HEADER};

// Include the generated protobuf code
pub mod proto {
    pub mod costwindow {
        pub mod v1 {
            tonic::include_proto!("costwindow.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::costwindow::v1::{
    cost_window_service_server::CostWindowServiceServer, CheckCapacityRequest,
    CheckCapacityResponse, ConsumerState, FlushRequest, FlushResponse, GetConsumerStateRequest,
    RecordCostRequest, RecordCostResponse,
};
