//! Helpers for testing pipelines and recipes.
//!
//! - [`MarkerLog`] records when each invocation starts and finishes, so tests can check that
//!   one stage was closed before the next opened.
//! - [`write_daily_dataset`] writes a small gridded dataset split across JSON input files and
//!   returns the matching [`Pattern`](crate::patterns::Pattern) and the full expected data.
//!
//! ```
//! use chunkforge::executors::{PipelineExecutor, SequentialExecutor};
//! use chunkforge::pipeline::{Pipeline, Stage};
//! use chunkforge::testing::MarkerLog;
//! use serde_json::json;
//!
//! let log = MarkerLog::new();
//! let p = Pipeline::with_stages(vec![
//!     Stage::new("a", log.instrument("a", |_, _| Ok(()))),
//!     Stage::mapped("b", log.instrument("b", |_, _| Ok(())), vec![json!(1), json!(2)]),
//! ])?;
//! SequentialExecutor::new().run(&p)?;
//! log.check_barriers(&["a", "b"])?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod fixtures;
pub mod markers;

pub use fixtures::{DailyFixture, DailyLayout, write_daily_dataset};
pub use markers::{Marker, MarkerKind, MarkerLog};
