//! Data store abstraction.
//!
//! Handlers talk to the [`DataStore`] traits; [`MemoryStore`] applies
//! commands to the [`FleetState`](crate::state::FleetState) state machine.

mod error;
mod event;
mod memory;
mod traits;

pub use error::{Result, StoreError};
pub use event::Event;
pub use memory::MemoryStore;
pub use traits::{
    CreateResourceRequest, DataStore, ResourceStore, StatusStore, UpdateResourceRequest,
    UpsertStatusRequest,
};
