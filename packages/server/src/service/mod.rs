//! Invocation pipeline.
//!
//! Every HTTP-triggered invocation is an [`Invocation`] request flowing
//! through a Tower stack:
//!
//! 1. **Load shedding** (`middleware::load_shed`): reject when too many
//!    invocations are in flight
//! 2. **Timeout** (`middleware::timeout`): cap each invocation
//! 3. **Metrics** (`middleware::metrics`): timing and outcome in `tracing` spans
//! 4. **Dispatch** (`invocation`): hand the call to the execution adapter

pub mod invocation;
pub mod middleware;

pub use invocation::{Invocation, InvocationOutput, InvokeService};
pub use middleware::{build_invocation_pipeline, InvocationPipeline};
