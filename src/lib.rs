//! # chunkforge
//!
//! Turn a large, regularly named collection of input files into one chunked store, and run
//! the work on whichever execution backend fits.
//!
//! ## Key Features
//!
//! - **Pattern indexing** - describe inputs as a product of concat and merge dimensions and
//!   enumerate every input key lazily, in a canonical order
//! - **Chunk planning** - group input keys into output chunks, optionally splitting each input
//!   into equal parts
//! - **Backend-agnostic pipelines** - ordered stages, singleton or mapped over opaque items,
//!   sharing one immutable config
//! - **Four executors** - sequential, thread pool, task graph and gated flow, all with the same
//!   stage-barrier guarantee
//! - **Store recipes** - cache inputs, prepare the target, store chunks, finalize metadata
//!
//! ## Quick Start
//!
//! ```
//! use chunkforge::executors::{ParallelExecutor, PipelineExecutor};
//! use chunkforge::{Config, Pipeline, Stage};
//! use serde_json::json;
//!
//! let pipeline = Pipeline::new(
//!     vec![
//!         Stage::new("prepare", |_, _| Ok(())),
//!         Stage::mapped(
//!             "work",
//!             |item, config| {
//!                 let prefix = config.get_str("prefix").unwrap_or_default();
//!                 let _name = format!("{prefix}{}", item.map(ToString::to_string).unwrap_or_default());
//!                 Ok(())
//!             },
//!             vec![json!("x"), json!("y"), json!(3)],
//!         ),
//!     ],
//!     Config::new().with("prefix", "p-"),
//! )?;
//!
//! ParallelExecutor::new().with_threads(2).run(&pipeline)?;
//! # Ok::<(), chunkforge::ForgeError>(())
//! ```
//!
//! ## Module Overview
//!
//! - [`patterns`] - dimensions, input keys and the pattern indexer
//! - [`chunks`] - chunk keys and the chunk planner
//! - [`pipeline`] / [`config`] - stages, pipelines and their shared configuration
//! - [`executors`] - sequential, parallel, graph and flow backends
//! - [`recipe`] - the four-phase store recipe
//! - [`io`] - fetchers, caches, codecs, input metadata and target stores
//! - [`dataset`] - the labeled-array model exchanged with codecs and targets
//! - [`metrics`] - per-stage counters and timings (feature `metrics`)
//! - [`testing`] - marker logs and dataset fixtures for tests

pub mod chunks;
pub mod config;
pub mod dataset;
pub mod error;
pub mod executors;
pub mod io;
pub mod logging;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patterns;
pub mod pipeline;
pub mod recipe;
pub mod testing;
pub mod utils;

pub use chunks::{ChunkKey, ChunkPlan, plan_chunks};
pub use config::Config;
pub use error::{ForgeError, Result};
pub use executors::{
    FlowExecutor, GraphExecutor, ParallelExecutor, PipelineExecutor, SequentialExecutor,
};
pub use patterns::{DimValue, Dimension, InputKey, Pattern};
pub use pipeline::{Pipeline, Stage};
pub use recipe::{RecipeOptions, StoreRecipe};
