//! convoy-core: Fan-out and orchestration logic
//!
//! The [`Executor`] runs one operation across many targets on a bounded
//! pool, looking transports up in a [`TransportRegistry`]. Also home to
//! the remote (proxy) transport and the static TOML inventory.

pub mod context;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod registry;
pub mod remote;

pub use context::{Context, default_concurrency};
pub use error::CoreError;
pub use executor::Executor;
pub use inventory::StaticInventory;
pub use registry::TransportRegistry;
pub use remote::RemoteTransport;
