//! A lightweight SOCKS5 proxy library
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT with bounded dial timeouts and reply-code mapping
//!     - BIND (ephemeral listener, two-reply flow)
//!     - UDP ASSOCIATE
//!     - No Authentication
//!     - Username/Password Authentication (multiple accounts)
//!     - Async using tokio, one task per connection
//!     - Dedicated UDP socket per client-target pair -> minimizes NAT
//!       and client identification issues
//!     - Time-out based socket cleanup
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socksd::{Config, Socks5Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let mut server = Socks5Server::new(config);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod auth;
pub mod commands;
pub mod config;
pub mod dialer;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod udp;

// Re-export main types at crate root for convenience
pub use auth::{Authenticator, CredentialStore};
pub use config::Config;
pub use dialer::Dialer;
pub use error::{DialError, Error, Result};
pub use protocol::{AddressType, AuthMethod, Command, ReplyCode, Version};
pub use server::Socks5Server;
