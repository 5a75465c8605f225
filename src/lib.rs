pub mod backlog;
pub mod config;
pub mod notify;
pub mod observability;
pub mod resp;
pub mod scheduler;
pub mod store;
pub mod subscriber;
pub mod sweeper;
pub mod worker;

pub use backlog::{BacklogError, BacklogStore, FsyncPolicy};
pub use config::{Args, ConfigError, WorkerConfig};
pub use notify::{ensure_expiry_notifications, EnsureOutcome, RepairMode};
pub use scheduler::Scheduler;
pub use store::{ExpiredKey, InMemoryStore, KeyType, KeyspaceStore, RedisStore, StoreError};
pub use subscriber::{EventSubscriber, SubscriberExit};
pub use sweeper::{SweepError, SweepReport, SweepSettings, Sweeper};
pub use worker::WorkerError;
