//! Core error types for convoy-core

use convoy_api::ValidationError;
use thiserror::Error;

/// Errors raised while loading inventory and resolving targets
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Inventory file could not be read
    #[error("failed to read inventory {path}: {reason}")]
    InventoryRead {
        /// Path that was tried
        path: String,
        /// I/O error message
        reason: String,
    },

    /// Inventory file is not valid TOML or has the wrong shape
    #[error("failed to parse inventory {path}: {reason}")]
    InventoryParse {
        /// Path, or `<string>` for inline inventories
        path: String,
        /// Parser message
        reason: String,
    },

    /// Target entry or option is invalid
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Pattern matched nothing in the inventory
    #[error("no targets matched '{0}'")]
    NoTargets(String),
}
