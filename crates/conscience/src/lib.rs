//! Conscience Kernel control plane.
//!
//! Two transports front one kernel: a binary gRPC plane (`NervousSystem`)
//! for the Planner and the Sentinel, and a message-framed JSON plane over
//! a persistent TCP connection for everything else. Both route through
//! the same permission pipeline; neither replicates approval logic.

#![deny(unsafe_code)]

/// Generated protobuf types for the `nervous.v1` RPC surface.
#[allow(missing_docs, clippy::pedantic, clippy::nursery)]
pub mod nervous_v1 {
    tonic::include_proto!("nervous.v1");
}

pub mod auth;
pub mod dispatch;
pub mod events;
pub mod ghost;
pub mod grpc;
pub mod kernel;
pub mod registry;

pub use kernel::{Kernel, KernelError, PermissionVerdict};
