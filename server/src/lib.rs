pub mod activator;
pub mod client;
pub mod drain;
pub mod job;
pub mod keys;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use activator::{HandlerRegistry, Invocation, JobActivator, JobHandler};
pub use client::{Client, EnqueueOptions};
pub use job::{FailureInfo, JobDescriptor, JobState};
pub use server::{Server, ServerState};
pub use storage::Storage;
pub use winch_config::ServerSettings;
