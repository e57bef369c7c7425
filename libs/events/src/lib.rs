//! # corral-events
//!
//! Event envelope and declared resource types exchanged between the control
//! plane and the corral host agent.
//!
//! ## Event Envelope
//!
//! Every request the agent receives is an [`Event`]:
//! - `name` selects the transition (`compute.instance.activate`, `ping`, ...)
//! - `data` carries the declared resources the transition applies to
//! - `replyTo` is present when the issuer expects a [`Reply`]
//!
//! ## Declared Resources
//!
//! The control plane owns instances, NICs, links, volumes and images. The agent
//! only reads them; the one field it writes back is the instance `externalId`
//! (carried in reply payloads).
//!
//! ## Ping / Pong
//!
//! Pings carry [`PingOptions`]; the agent answers with a [`Pong`] listing
//! [`InventoryRecord`]s for this host.

mod envelope;
mod error;
mod ping;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use ping::*;
pub use types::*;
