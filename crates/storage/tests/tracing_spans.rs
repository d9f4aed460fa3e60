//! Verifies that backend operations produce tracing spans.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use sso_ticket_storage::{MemoryBackend, StorageBackend, testutil::replicated_backend};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer, records span names as they are created
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

fn collect() -> (Arc<Mutex<Vec<String>>>, tracing::subscriber::DefaultGuard) {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));
    (spans, guard)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memory_backend_operations_create_spans() {
    let (spans, _guard) = collect();

    let backend = MemoryBackend::new();
    backend.set(b"k".to_vec(), b"v".to_vec()).await.expect("set");
    let _ = backend.get(b"k").await;
    let _ = backend.compare_and_set(b"k", Some(b"v"), b"w".to_vec(), None).await;
    let _ = backend.take(b"k").await;
    let _ = backend.transaction().await;

    let recorded = spans.lock().expect("lock poisoned");
    for name in ["set", "get", "compare_and_set", "take", "transaction"] {
        assert!(recorded.iter().any(|s| s == name), "expected a '{name}' span, got: {recorded:?}");
    }
}

#[tokio::test]
async fn replicated_backend_health_check_creates_span() {
    let (spans, _guard) = collect();

    let backend = replicated_backend();
    let _ = backend.health_check().await;

    let recorded = spans.lock().expect("lock poisoned");
    assert!(
        recorded.iter().any(|s| s == "health_check"),
        "expected a 'health_check' span, got: {recorded:?}"
    );
}
