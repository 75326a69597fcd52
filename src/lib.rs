//! Leap
//!
//! Host-native concurrency primitives for an embedded scripting runtime.
//! Scripts get a mutex, a wait group and threads that run script functions
//! on a worker pool, all backed by host objects that scripts only ever see
//! through integer handles.
//!
//! # Example
//!
//! ```no_run
//! use leap::{Leap, Result};
//!
//! fn main() -> Result<()> {
//!     let leap = Leap::from_env()?;
//!     let ctx = leap.context();
//!
//!     ctx.get_global("leap")?;
//!     ctx.get_field(-1, "WaitGroup")?;
//!     ctx.call(0, 1)?;
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

// Public modules
pub mod bridge;
pub mod runtime;
pub mod std;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

use ::std::sync::Arc;

use tracing::debug;

use crate::bridge::Bridge;
use crate::runtime::Runtime;
use crate::util::config::LeapConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = "Leap";

/// A runtime with the `leap` module opened and a bridge attached.
#[derive(Debug)]
pub struct Leap {
    runtime: Runtime,
    bridge: Arc<Bridge>,
    config: LeapConfig,
}

impl Leap {
    /// Build a runtime and bridge from `config` and open the libraries.
    pub fn new(config: LeapConfig) -> Result<Self> {
        let runtime = Runtime::new(config.runtime.clone());
        let bridge =
            Bridge::new(config.scheduler.clone()).context("failed to start the worker pool")?;
        crate::std::open_libs(runtime.main(), &bridge)
            .context("failed to open the leap libraries")?;
        debug!(workers = bridge.scheduler().worker_count(), "leap ready");

        Ok(Self {
            runtime,
            bridge,
            config,
        })
    }

    /// [`Leap::new`] with [`LeapConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        Self::new(LeapConfig::from_env()?)
    }

    /// The main context.
    #[inline]
    pub fn context(&self) -> &runtime::Context {
        self.runtime.main()
    }

    #[inline]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    #[inline]
    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    #[inline]
    pub fn config(&self) -> &LeapConfig {
        &self.config
    }
}
