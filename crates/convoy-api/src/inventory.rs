//! Lookup of resolved targets

use crate::error::ValidationError;
use crate::target::Target;

/// Source of resolved targets
///
/// Held by reference where a transport needs to find other targets, such
/// as the proxy a remote target runs through. Lookups never hand out
/// ownership of inventory state.
pub trait Inventory: Send + Sync {
    /// Target with exactly this name, if known
    fn get_target(&self, name: &str) -> Option<Target>;

    /// Resolve a comma separated list of names, groups or URIs
    ///
    /// # Errors
    /// Returns `ValidationError` if an entry is neither known nor a valid URI.
    fn get_targets(&self, pattern: &str) -> Result<Vec<Target>, ValidationError>;
}
