// AMOSKYS Protocol Buffers
//
// This crate owns the telemetry wire schema and its tonic codegen. Downstream
// crates get the generated types plus re-exported prost/tonic so they never
// need their own direct protobuf dependency.

pub use prost;
pub use prost_types;
pub use tonic;

pub mod amoskys {
  pub mod v1 {
    tonic::include_proto!("amoskys.v1");

    pub use self::{
      event_bus_client::EventBusClient,
      event_bus_server::{EventBus, EventBusServer},
    };
  }
}

pub use amoskys::v1::*;
