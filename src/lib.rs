//! # pedia-core
//!
//! Build orchestration for the Tectonopedia, a reference encyclopedia compiled
//! from TeX to HTML.
//!
//! Every input is compiled twice. Pass 1 asks the TeX engine which outputs,
//! definitions, texts and references each input contains. The resolver then
//! joins all of those records into one [`ResolutionTable`], and pass 2
//! recompiles each input with exactly the resolved cross-reference data it
//! asked for. Both passes are cached: an input is only recompiled when its
//! content, or the slice of the resolution table it consumed, has changed.
//!
//! ## Architecture
//!
//! - **[`records`]**: index records, the line codec used on the wire, and the
//!   per-input [`IndexRecordStore`]
//! - **[`resolve`]**: the cross-reference resolver and its validation errors
//! - **[`cache`]**: the SQLite-backed incremental build cache
//! - **[`engine`]**: the [`TexEngine`] seam and the subprocess driver
//! - **[`build`]**: the two-pass scheduler and worker pool
//! - **[`messages`]**: build events and the buses that carry them
//! - **[`config`]**: `pedia.toml`
//! - `serve` and `watch` (feature `service`): the build dashboard server and
//!   the filesystem watcher behind `pedia serve`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pedia_core::{
//!     build::{BuildDriver, CancelSignal},
//!     config::BuildConfig,
//!     engine::ProcessEngine,
//!     messages::LogBus,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pedia_core::PediaError> {
//!     let config = BuildConfig::load(std::path::Path::new("."))?;
//!     let engine = ProcessEngine::from_config(&config.engine);
//!     let driver = BuildDriver::new(config, engine, LogBus).await?;
//!     let summary = driver.build(&CancelSignal::new()).await?;
//!     println!("build {:?}", summary.state);
//!     Ok(())
//! }
//! ```

pub mod build;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod messages;
pub mod records;
pub mod resolve;
#[cfg(feature = "service")]
pub mod serve;
#[cfg(feature = "service")]
pub mod watch;

pub use build::{BuildDriver, BuildState, BuildSummary, CancelSignal};
pub use engine::{EngineError, TexEngine};
pub use error::*;
pub use records::{IndexKey, IndexRecord, IndexRecordStore};
pub use resolve::{ResolutionError, ResolutionTable};
