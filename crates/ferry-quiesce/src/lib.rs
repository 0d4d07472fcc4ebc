//! Quiescing the source namespace around a volume transfer
//!
//! Before a copy starts, every controller that could keep a writer running
//! against the volume is stopped; afterwards it is put back exactly as it
//! was. The pre-quiesce value lives in an annotation on the object itself.

#![deny(missing_docs)]

pub mod annotations;
mod controller;

pub use controller::{
    active_writer_pods, quiesce, quiesce_and_wait, unquiesce, wait_for_termination,
    QuiesceOptions, QuiesceReport, WorkloadKind, WorkloadRef,
};
