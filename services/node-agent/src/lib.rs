//! corral Node Agent Library
//!
//! The node agent runs on each container host. It receives events describing
//! the desired state of instances, images and volumes, and converges the local
//! container engine to match.
//!
//! ## Architecture
//!
//! ```text
//! stdin ──► transport ──► Agent (bounded workers) ──► Dispatcher
//!                                                        ├── InstanceReconciler
//!                                                        ├── ImageReconciler
//!                                                        ├── VolumeReconciler
//!                                                        ├── PingHandler
//!                                                        └── DelegateHandler
//! stdout ◄── transport ◄── replies / progress ◄──────────────┘
//! ```
//!
//! Reconcilers share one `LockManager`; work on the same resource identity
//! is serialized, everything else runs in parallel.
//!
//! ## Modules
//!
//! - `runtime`: container engine interface, Docker and in-memory engines
//! - `network`: NIC and network service translation into container settings
//! - `image`, `instance`, `volume`: reconcilers
//! - `state`: per-container state records

pub mod agent;
pub mod config;
pub mod delegate;
pub mod dispatcher;
pub mod error;
pub mod image;
pub mod instance;
pub mod network;
pub mod ping;
pub mod progress;
pub mod runtime;
pub mod state;
pub mod transport;
pub mod volume;

// Re-export commonly used types
pub use agent::Agent;
pub use config::{Config, ConfigOverrides, RuntimeBackend};
pub use dispatcher::Dispatcher;
pub use error::AgentError;
pub use image::ImageReconciler;
pub use instance::{ActivationMode, InstanceReconciler};
pub use ping::{HostStats, PingHandler};
pub use runtime::{DockerRuntime, MockRuntime, RuntimeClient};
pub use volume::VolumeReconciler;
