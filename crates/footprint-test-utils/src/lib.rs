//! Test support for the footprint crates.
//!
//! [`TracingMemoryBackend`] records storage calls and injects faults,
//! [`TestContext`] pairs it with a merge configuration and writes fragments
//! and snapshots, and the fixture functions build catalog rows from WKT.
//!
//! ```rust,ignore
//! use footprint_test_utils::{TestContext, footprint, square};
//!
//! #[tokio::test]
//! async fn single_fragment_merges() {
//!     let ctx = TestContext::new();
//!     let row = footprint("a", square(0.0, 0.0, 1.0), "2024-01-01T00:00:00Z");
//!     ctx.put_fragment("u1", &[row]).await;
//!     let outcome = ctx.engine().run().await.unwrap();
//!     assert_eq!(outcome.merged_fragments, 1);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod storage;

pub use assertions::*;
pub use fixtures::*;
pub use storage::*;

/// Routes `tracing` output to the test harness at debug level.
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::from_default_env()
        .add_directive("footprint=debug".parse().expect("directive parses"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
