//! Feature-flag client for the FluidFeatures service.
//!
//! Flag state is long-polled into a local cache by a background loop and
//! every check is answered from that cache. Finished transactions are batched
//! and reported by a second loop, with overflow kept on disk.
//!
//! # Examples
//! ```no_run
//! use fluidfeatures::User;
//!
//! let app = fluidfeatures::init()
//!     .base_uri("https://www.fluidfeatures.com/service")
//!     .app_id("1vu33ki6emqe3")
//!     .secret("sssseeecrrreeetttt")
//!     .cache("tmp/fluidfeatures", 2 * 1024 * 1024)
//!     .build()?;
//!
//! let user = User::new(42).cohort_attr("company", "acme");
//! let mut transaction = app.transaction(&user, "/checkout");
//! if transaction.feature_enabled("new-checkout", None, false)? {
//!     transaction.goal_hit("purchase", None)?;
//! }
//! transaction.end_transaction()?;
//! # Ok::<(), fluidfeatures::Error>(())
//! ```

pub mod app;
pub mod assign;
pub mod builder;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod feature_version;
pub mod features;
pub mod payload;
pub mod polling;
pub mod reporter;
pub mod state;
pub mod store;
pub mod transaction;

pub use app::{App, User};
pub use client::{Api, FeaturesResponse, HttpClient};
pub use config::{CacheConfig, Config};
pub use error::{Error, Result};
pub use feature_version::FeatureVersion;
pub use features::{Feature, FeatureSnapshot, UnknownFeatures, Version, DEFAULT_VERSION_NAME};
pub use payload::{TransactionPayload, UserId};
pub use transaction::Transaction;

/// Returns a builder for configuring a client.
pub fn init() -> builder::AppBuilder {
    builder::create_builder()
}
