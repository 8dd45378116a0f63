//! Secret types for values that must never reach logs.
//!
//! Re-exports the [`secrecy`] types. Connection strings carrying credentials
//! (for example a `redis://:password@host` URL) are held as [`SecretString`],
//! whose `Debug` output is redacted, so deriving `Debug` on a config struct
//! stays safe.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let url = SecretString::from("redis://:hunter2@localhost:6379");
//! assert!(!format!("{url:?}").contains("hunter2"));
//! assert!(url.expose_secret().starts_with("redis://"));
//! ```

pub use secrecy::{ExposeSecret, SecretString};
