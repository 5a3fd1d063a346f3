//! Fleet controller: the sentinel decision loop and adapter reconciliation
//! workers, talking to the fleet API over HTTP and to each other over a
//! broker.

pub mod adapter;
pub mod broker;
pub mod client;
pub mod config;
pub mod sentinel;

pub use adapter::{Adapter, AdapterError, Outcome, WorkerConfig, run_worker};
pub use broker::{Broker, BrokerError, Delivery, MemoryBroker, Subscription};
pub use client::{ClientError, HttpResourceClient, ResourceClient, UpsertOutcome};
pub use config::{AdapterConfig, ConfigError};
pub use sentinel::{DecisionConfig, Sentinel, SentinelConfig, TickSummary, TriggerError};
