//! pairlink: link a client to a remote storage account.
//!
//! Two protocols are supported: session-code pairing, where a companion app
//! scans a code and confirms, and the OAuth 2.0 device authorization grant
//! with PKCE. Both run on a shared bounded polling loop and report progress
//! as a stream of events that ends with exactly one terminal event.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use pairlink::auth::{AuthEngine, AuthEvent, CredentialSink};
//! use pairlink::config::PairlinkConfig;
//!
//! # async fn example() -> pairlink::error::Result<()> {
//! let config = PairlinkConfig::load()?;
//! let engine = AuthEngine::with_options(Arc::new(config.transport()?), config.engine_options());
//!
//! let mut events = engine.begin_device_authorization(config.client_context());
//! while let Some(event) = events.next().await {
//!     match event {
//!         AuthEvent::CodeIssued { user_code, verification_uri, .. } => {
//!             println!("Visit {verification_uri} and enter {user_code}");
//!         }
//!         AuthEvent::Authorized { credential } => {
//!             config.credential_store().save("default", &credential)?;
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
