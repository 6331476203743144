//! Subscription worker and its supervisor

pub mod supervisor;
pub mod worker;

pub use supervisor::{RestartDecision, RestartPolicy, SupervisorError, WorkerSupervisor};
pub use worker::{SubscriptionWorker, WorkerControl, WorkerError, WorkerSettings, WorkerState};
