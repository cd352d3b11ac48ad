//! # Receiver Test Utilities
//!
//! Shared test utilities for the accessory receiver.
//!
//! This crate provides mock implementations of every platform trait and a
//! harness that runs a real `ServerActor` against them, so integration
//! tests can drive whole sessions without a network or a key exchange.
//!
//! ## Modules
//!
//! - `mock_platform` - Mock advertiser, listener, authenticator and clock
//! - `mock_link` - Recording controller link
//! - `mock_delegate` - Recording server and session delegates
//! - `fixtures` - Configs, connections, stream setups and the `TestReceiver` harness
//!
//! ## Usage
//!
//! ```rust,ignore
//! use receiver_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let receiver = TestReceiver::builder().build();
//!     receiver.server.start().await.unwrap();
//!
//!     let session = receiver.connect().await;
//!     session.activate().await;
//!
//!     receiver.shutdown().await;
//! }
//! ```

pub mod fixtures;
pub mod mock_delegate;
pub mod mock_link;
pub mod mock_platform;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_delegate::*;
pub use mock_link::*;
pub use mock_platform::*;

use std::time::Duration;

/// How long [`wait_for`] polls before failing the test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds.
///
/// # Panics
///
/// If `condition` is still false after [`WAIT_TIMEOUT`].
pub async fn wait_for<F: FnMut() -> bool>(mut condition: F) {
    let polled = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met within {WAIT_TIMEOUT:?}");
}
