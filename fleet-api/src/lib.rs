pub mod audit;
pub mod command;
pub mod merge;
pub mod rest;
pub mod state;
pub mod store;

pub use audit::{ApiAuditLogger, create_audit_logger};
pub use command::{Command, ReportOutcome, Response, StatusHistoryEntry, UpsertStatusResult};
pub use state::{DEFAULT_HISTORY_LIMIT, FleetState, RequiredAdapters};
pub use store::{DataStore, Event, MemoryStore, StoreError};
