//! Local state persistence for the node agent.
//!
//! The only state the agent keeps is one record per bound container: the
//! instance snapshot taken when the container was first activated. Everything
//! else is re-derived from the engine on demand.

mod store;

pub use store::{ContainerStateStore, StateStoreError};
