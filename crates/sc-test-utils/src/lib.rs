//! # SC Test Utilities
//!
//! Mocks and fixtures for exercising coordinators and location registries
//! without Redis or a networked fabric.
//!
//! ## Modules
//!
//! - `cluster` - shared bus, discovery and a running location registry
//! - `mock_relay` - scriptable relay node speaking the relay RPC contract
//! - `test_client` - wire-level peer client over any byte stream
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let cluster = TestCluster::start().await;
//!     let relay = cluster.add_relay("relay-1", 0).await;
//!
//!     // Start coordinators against cluster.registry() and cluster.bus(),
//!     // then connect TestClients to them.
//! }
//! ```

pub mod cluster;
pub mod mock_relay;
pub mod test_client;

pub use cluster::*;
pub use mock_relay::*;
pub use test_client::*;

use std::future::Future;
use std::time::Duration;

/// How long helpers wait before declaring a test hung.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds.
///
/// # Panics
///
/// Panics if it does not hold within [`WAIT_TIMEOUT`].
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let polled = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Await `future`, panicking if it takes longer than [`WAIT_TIMEOUT`].
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    match tokio::time::timeout(WAIT_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}
