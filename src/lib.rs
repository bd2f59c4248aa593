//! cloud_drive - A client for the Amazon Cloud Drive REST API.
//!
//! This library provides:
//! - OAuth2 token management with proactive, single-flight refresh
//! - Automatic retry with jittered exponential backoff on rate limiting
//! - Uniform structured errors across the metadata and content services
//! - Node lookup, listing, creation, rename, move, trash, upload, download,
//!   change feed polling and quota queries
//!
//! # Example
//!
//! ```no_run
//! use cloud_drive::{Authenticator, ClientConfig, CloudDrive};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let auth = Authenticator::from_file("credentials.json")?;
//!     let client = CloudDrive::connect(reqwest::Client::new(), auth, ClientConfig::default()).await?;
//!
//!     let root = client.lookup_root().await?;
//!     for node in client.node_children(&root.id).await? {
//!         println!("{}", node);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod models;
pub mod request;

// Re-exports for convenience
pub use auth::Authenticator;
pub use client::{CloudDrive, Download};
pub use config::ClientConfig;
pub use endpoint::Endpoints;
pub use error::{ApiError, CloudDriveError, ErrorCode, Result};
pub use models::{Changes, Credentials, Node, NodeKind, Quota};
pub use request::ByteRange;
