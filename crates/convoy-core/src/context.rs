//! Cross-cutting state threaded through a run

use std::num::NonZeroUsize;

use convoy_api::{EventSink, ProgressEvent};
use tracing::Span;

const MAX_DEFAULT_CONCURRENCY: usize = 100;

/// Worker pool size when none is configured
///
/// Eight units per available core, capped at 100.
#[must_use]
pub fn default_concurrency() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    cores.saturating_mul(8).min(MAX_DEFAULT_CONCURRENCY)
}

/// Logger handle, pool size and progress sink for one executor
#[derive(Clone)]
pub struct Context {
    span: Span,
    concurrency: usize,
    events: Option<EventSink>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self {
            span: tracing::info_span!("convoy"),
            concurrency: default_concurrency(),
            events: None,
        }
    }

    /// Use `concurrency` workers; zero is treated as one
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[must_use]
    pub fn events(&self) -> Option<&EventSink> {
        self.events.as_ref()
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = &self.events {
            sink(&event);
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("concurrency", &self.concurrency)
            .field("events", &self.events.is_some())
            .finish_non_exhaustive()
    }
}
