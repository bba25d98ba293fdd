//! Session wiring.
//!
//! [`RunnerApp`] owns one instance of every service, built explicitly from injected
//! collaborators, and runs the background loops (queue drain, profile refresh, ranking pass,
//! subscription check) between [`RunnerApp::start`] and [`RunnerApp::shutdown`].
mod api;
mod settings;

#[doc(inline)]
pub use api::{RunnerApp, RunnerAppBuilder, SDK_VERSION};

#[doc(inline)]
pub use settings::RunnerSettings;
