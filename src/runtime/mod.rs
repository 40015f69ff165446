//! Minimal in-process subset of a durable workflow runtime.
//!
//! The engine's design assumes a replay-capable workflow runtime with task
//! queues, activities, signals, heartbeats and child workflows. This
//! module embeds the minimum subset in one process:
//!
//! - `TaskQueue`: a named queue with a concurrency limit; activities run
//!   through it with retry, start-to-close timeout and heartbeat
//!   monitoring
//! - `SignalChannel`: FIFO signal delivery between workflow executions
//! - `CancelToken`: hierarchical cooperative cancellation, with a
//!   disconnected variant for compensation contexts
//! - `ChildWorkflow`: a spawned workflow whose handle terminates the child
//!   when dropped (parent-close policy: terminate)
//!
//! Workflow code only holds handles to the queues the routing table allows
//! it to use, which is how queue routing is enforced in-process.

mod cancel;
mod heartbeat;
mod retry;
mod signal;
mod task_queue;
mod workflow;

pub use cancel::CancelToken;
pub use heartbeat::Heartbeat;
pub use retry::RetryPolicy;
pub use signal::{signal_channel, SignalReceiver, SignalSender};
pub use task_queue::{ActivityContext, ActivityError, ActivityOptions, TaskQueue};
pub use workflow::ChildWorkflow;
