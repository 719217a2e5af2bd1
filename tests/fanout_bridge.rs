//! `tracing` bridge installed as the process-wide subscriber.
//!
//! Run with: cargo test --test fanout_bridge

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use callwatch::config::LoggingConfig;
use callwatch::logging::{
    FanOutLayer, FanOutLoggerFactory, Level, LogRecord, LogSink, SinkError, SinkProvider,
};
use serial_test::serial;
use tracing_subscriber::layer::SubscriberExt;

/// Counts writes and reports each one through `tracing`.
struct CountingSink {
    writes: Arc<AtomicUsize>,
}

impl LogSink for CountingSink {
    fn is_enabled(&self, _level: Level) -> bool {
        true
    }

    fn log(&self, record: &LogRecord) -> Result<(), SinkError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(target: "sink_internal", category = %record.category, "sink wrote record");
        Ok(())
    }
}

struct CountingProvider {
    name: &'static str,
    writes: Arc<AtomicUsize>,
}

impl SinkProvider for CountingProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn create_logger(&self, _category: &str) -> Arc<dyn LogSink> {
        Arc::new(CountingSink {
            writes: self.writes.clone(),
        })
    }
}

/// Install the bridge as the global subscriber once; return the write counter.
fn writes() -> &'static Arc<AtomicUsize> {
    static WRITES: OnceLock<Arc<AtomicUsize>> = OnceLock::new();
    WRITES.get_or_init(|| {
        let writes = Arc::new(AtomicUsize::new(0));
        let providers: Vec<Arc<dyn SinkProvider>> = ["first", "second"]
            .into_iter()
            .map(|name| {
                Arc::new(CountingProvider {
                    name,
                    writes: writes.clone(),
                }) as Arc<dyn SinkProvider>
            })
            .collect();

        let both = vec!["first".to_string(), "second".to_string()];
        let config = LoggingConfig {
            default_sinks: Vec::new(),
            categories: HashMap::from([
                ("app".to_string(), both.clone()),
                ("sink_internal".to_string(), both),
            ]),
        };
        let factory = FanOutLoggerFactory::with_workers(config, providers, 2)
            .expect("factory builds");

        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(FanOutLayer::new(factory)),
        )
        .expect("no other global subscriber");

        writes
    })
}

#[test]
#[serial]
fn test_sink_events_do_not_reenter_global_bridge() {
    let writes = writes();
    writes.store(0, Ordering::SeqCst);

    tracing::info!(target: "app", "order placed");

    assert_eq!(writes.load(Ordering::SeqCst), 2);
}

#[test]
#[serial]
fn test_repeated_events_from_many_threads_each_reach_both_sinks() {
    let writes = writes();
    writes.store(0, Ordering::SeqCst);

    let handles: Vec<_> = (0..4)
        .map(|i| thread::spawn(move || tracing::warn!(target: "app", worker = i, "stock low")))
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    tracing::info!(target: "app", "done");

    assert_eq!(writes.load(Ordering::SeqCst), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_events_from_async_tasks_reach_both_sinks() {
    let writes = writes();
    writes.store(0, Ordering::SeqCst);

    let tasks: Vec<_> = (0..3)
        .map(|i| {
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                tracing::info!(target: "app", request = i, "handled");
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(writes.load(Ordering::SeqCst), 6);
}
