//! Lookup table from transport kind to its shared instance

use std::collections::HashMap;
use std::sync::Arc;

use convoy_api::{Inventory, TransportKind};
use convoy_exec::{ConnectionTransport, OrchTransport, Transport};

use crate::remote::RemoteTransport;

/// One transport instance per kind, shared by every target of that kind
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// Registry with no transports
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in transport
    ///
    /// The remote transport resolves its proxies through `inventory` and
    /// runs them with the other transports registered here.
    #[must_use]
    pub fn with_defaults(inventory: Arc<dyn Inventory>) -> Self {
        let mut registry = Self::empty();
        for kind in [
            TransportKind::Ssh,
            TransportKind::Winrm,
            TransportKind::Local,
            TransportKind::Docker,
            TransportKind::Podman,
            TransportKind::Lxd,
        ] {
            registry.register(kind, Arc::new(ConnectionTransport::new(kind)));
        }
        registry.register(TransportKind::Orch, Arc::new(OrchTransport::new()));

        let remote = RemoteTransport::new(inventory, registry.clone());
        registry.register(TransportKind::Remote, Arc::new(remote));
        registry
    }

    /// Add or replace the transport for `kind`
    pub fn register(&mut self, kind: TransportKind, transport: Arc<dyn Transport>) {
        self.transports.insert(kind, transport);
    }

    #[must_use]
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.transports.get(&kind).cloned()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.transports.keys().map(TransportKind::name).collect();
        kinds.sort_unstable();
        f.debug_struct("TransportRegistry").field("kinds", &kinds).finish()
    }
}
