//! Offline-first sync, leaderboard ranking and currency ledger core for a mobile bot-runner game.
//!
//! Every component is an explicit service built once per session by [`app::RunnerApp`]:
//!
//! - [`cache`]: device-local key/value store with typed, versioned blobs.
//! - [`queue`]: durable FIFO of writes waiting for the remote store.
//! - [`remote`]: document store abstraction plus an in-memory implementation.
//! - [`sync`]: read-through / write-behind arbiter for profiles and bots.
//! - [`leaderboard`]: score fan-out, partition ranking and tournaments.
//! - [`monetization`]: currency ledger, purchases, subscriptions and rewarded ads.
//!
//! ```
//! use std::sync::Arc;
//! use runner_sync::app::RunnerApp;
//! use runner_sync::identity::StaticIdentityProvider;
//! use runner_sync::leaderboard::ScoreSubmission;
//! use runner_sync::model::CurrencyType;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let app = RunnerApp::builder()
//!     .identity(Arc::new(StaticIdentityProvider::signed_in("runner-1")))
//!     .build()
//!     .unwrap();
//! app.start().await.unwrap();
//!
//! let receipt = app
//!     .leaderboard()
//!     .submit_score(ScoreSubmission::new(4_200, "dash"))
//!     .await
//!     .unwrap();
//! assert!(receipt.new_high_score);
//!
//! app.ledger().spend_currency(CurrencyType::Coins, 300, "upgrade").await.unwrap();
//! assert_eq!(app.ledger().balance(CurrencyType::Coins).await.unwrap(), 700);
//! app.shutdown().await;
//! # });
//! ```

pub mod analytics;
pub mod app;
pub mod cache;
pub mod connectivity;
pub mod error;
pub mod identity;
pub mod leaderboard;
pub mod logger;
pub mod model;
pub mod monetization;
pub mod platform;
pub mod queue;
pub mod remote;
pub mod sync;
pub mod util;
