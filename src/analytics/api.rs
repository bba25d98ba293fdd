use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use crate::analytics::events::MetricEvent;
use crate::error::RunnerResult;
use crate::logger::Logger;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@runner/analytics"));

/// External "track event" endpoint.
pub trait AnalyticsSink: Send + Sync {
    fn track(&self, name: &str, params: &BTreeMap<String, String>) -> RunnerResult<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAnalyticsSink;

impl AnalyticsSink for NoopAnalyticsSink {
    fn track(&self, _name: &str, _params: &BTreeMap<String, String>) -> RunnerResult<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalyticsEvent {
    pub name: String,
    pub params: BTreeMap<String, String>,
}

/// Sink keeping every tracked event in memory.
#[derive(Clone, Debug, Default)]
pub struct RecordingAnalyticsSink {
    events: Arc<Mutex<Vec<AnalyticsEvent>>>,
}

impl RecordingAnalyticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn named(&self, name: &str) -> Vec<AnalyticsEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.name == name)
            .cloned()
            .collect()
    }
}

impl AnalyticsSink for RecordingAnalyticsSink {
    fn track(&self, name: &str, params: &BTreeMap<String, String>) -> RunnerResult<()> {
        self.events.lock().unwrap().push(AnalyticsEvent {
            name: name.to_string(),
            params: params.clone(),
        });
        Ok(())
    }
}

/// Fire-and-forget front end over an [`AnalyticsSink`]. Sink failures are logged, never returned.
#[derive(Clone)]
pub struct Analytics {
    inner: Arc<AnalyticsInner>,
}

struct AnalyticsInner {
    sink: Arc<dyn AnalyticsSink>,
    default_event_params: Mutex<BTreeMap<String, String>>,
    collection_enabled: AtomicBool,
}

impl fmt::Debug for Analytics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analytics")
            .field("enabled", &self.is_collection_enabled())
            .finish()
    }
}

impl Default for Analytics {
    fn default() -> Self {
        Self::new(Arc::new(NoopAnalyticsSink))
    }
}

impl Analytics {
    pub fn new(sink: Arc<dyn AnalyticsSink>) -> Self {
        Self {
            inner: Arc::new(AnalyticsInner {
                sink,
                default_event_params: Mutex::new(BTreeMap::new()),
                collection_enabled: AtomicBool::new(true),
            }),
        }
    }

    pub fn log_event(&self, event: &MetricEvent) {
        if !self.is_collection_enabled() {
            return;
        }
        let mut params = self.inner.default_event_params.lock().unwrap().clone();
        params.extend(event.params());
        if let Err(err) = self.inner.sink.track(event.name(), &params) {
            LOGGER.debug(format!("analytics sink rejected {}: {err}", event.name()));
        }
    }

    /// Parameters merged into every event; event parameters win on key clashes.
    pub fn set_default_event_parameters(&self, params: BTreeMap<String, String>) {
        *self.inner.default_event_params.lock().unwrap() = params;
    }

    pub fn set_collection_enabled(&self, enabled: bool) {
        self.inner
            .collection_enabled
            .store(enabled, Ordering::SeqCst);
    }

    pub fn is_collection_enabled(&self) -> bool {
        self.inner.collection_enabled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::internal_error;

    struct FailingSink;

    impl AnalyticsSink for FailingSink {
        fn track(&self, _name: &str, _params: &BTreeMap<String, String>) -> RunnerResult<()> {
            Err(internal_error("sink offline"))
        }
    }

    #[test]
    fn flattens_events_with_defaults() {
        let sink = RecordingAnalyticsSink::new();
        let analytics = Analytics::new(Arc::new(sink.clone()));
        analytics.set_default_event_parameters(BTreeMap::from([(
            "app_version".to_string(),
            "3.2.0".to_string(),
        )]));

        analytics.log_event(&MetricEvent::CurrencySpent {
            currency: "gems".into(),
            amount: 30,
            purpose: "upgrade_speed".into(),
        });

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "currency_spent");
        assert_eq!(events[0].params["amount"], "30");
        assert_eq!(events[0].params["app_version"], "3.2.0");
    }

    #[test]
    fn disabled_collection_and_failing_sink_are_silent() {
        let sink = RecordingAnalyticsSink::new();
        let analytics = Analytics::new(Arc::new(sink.clone()));
        analytics.set_collection_enabled(false);
        analytics.log_event(&MetricEvent::SyncDegraded {
            reason: "offline".into(),
        });
        assert!(sink.events().is_empty());

        Analytics::new(Arc::new(FailingSink)).log_event(&MetricEvent::QueueDrained {
            applied: 1,
            remaining: 0,
        });
    }
}
