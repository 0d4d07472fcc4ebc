//! Moving volume contents between clusters
//!
//! Three families compose a copy:
//!
//! - [`Endpoint`]: the destination-side entry point (Route, Ingress or
//!   Service)
//! - [`Transport`]: an optional tunnel in front of it, contributing side-car
//!   containers to both pods
//! - [`Transfer`]: the server and client workloads that do the copying
//!   (rsync, rclone or blockrsync)
//!
//! All cluster access goes through [`ferry_common::ObjectStore`]. Nothing
//! here retries, and nothing cleans up after a failure.

#![deny(missing_docs)]

pub mod endpoint;
pub mod meta;
mod resources;
pub mod template;
pub mod transfer;
pub mod transport;

pub use endpoint::{Endpoint, EndpointType};
pub use meta::{Pvc, PvcPair, PvcPairList};
pub use transfer::{Transfer, TransferType};
pub use transport::{connection_target, Transport, TransportType};
