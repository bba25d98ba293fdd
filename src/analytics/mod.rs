//! Analytics collaborator: typed metric events flattened onto an external sink.

mod api;
mod events;

pub use api::{Analytics, AnalyticsEvent, AnalyticsSink, NoopAnalyticsSink, RecordingAnalyticsSink};
pub use events::MetricEvent;
