//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] wrappers. Everything a session negotiates that
//! would let a third party decrypt traffic (symmetric keys, IVs, PINs, the
//! configured password) is held in one of these so that `{:?}` and tracing
//! fields can never print it.
//!
//! `SecretBox<T>` and `SecretString` implement `Debug` with redaction, so a
//! struct that derives `Debug` and contains one of them is safe to log.
//! Secrets are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretBox};
//!
//! #[derive(Debug)]
//! struct KeyMaterial {
//!     label: &'static str,
//!     key: SecretBox<Vec<u8>>,
//! }
//!
//! let material = KeyMaterial {
//!     label: "session",
//!     key: SecretBox::new(Box::new(vec![0x42; 16])),
//! };
//!
//! // Debug output hides the key bytes
//! assert!(!format!("{material:?}").contains("66"));
//! assert_eq!(material.key.expose_secret().len(), 16);
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
