//! Code execution pipeline: durable job records, a work queue, and the
//! worker that runs each job in a throwaway container.

mod model;
mod processor;
mod queue;
mod repository;
mod service;

pub use model::{
    ExecutionJob, JobDetail, JobOutcome, JobStatus, JobSummary, JobWithHistory, StatusEntry,
    UNKNOWN_STATUS,
};
pub use processor::ExecutionProcessor;
pub use queue::{DeliveryPolicy, JobHandler, JobMessage, JobQueue, MemoryQueue, QueueError, WorkerPool};
pub use repository::JobRepository;
pub use service::ExecutionService;
