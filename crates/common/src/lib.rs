//! Common utilities and shared types for quill.

pub mod config;
pub mod crypto;
pub mod cursor;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod timefmt;

pub use config::Config;
pub use crypto::{generate_rsa_keypair, RsaKeypair};
pub use error::{AppError, AppResult};
pub use metrics::{get_metrics, Metrics, MetricsSnapshot};
