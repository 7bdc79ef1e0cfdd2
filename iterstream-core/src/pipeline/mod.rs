// iterstream-core/src/pipeline/mod.rs

//! Composable lazy pipelines.
//!
//! A pipeline starts from a source and grows one [`Stage`] at a time. Stages
//! are pure descriptions until the pipeline is iterated; a pull on the
//! outermost stage pulls exactly as much from upstream as it needs for one
//! item. The only concurrency lives inside [`AsyncMap`], whose pool is fed
//! and drained by the pulling thread.
//!
//! # Example
//!
//! ```
//! use iterstream_core::source;
//!
//! let batches = source((0..10).collect::<Vec<u32>>())
//!     .async_map(|x| x * x)
//!     .batched(4)
//!     .collect()
//!     .unwrap();
//! assert_eq!(batches, vec![vec![0, 1, 4, 9], vec![16, 25, 36, 49], vec![64, 81]]);
//! ```

mod async_map;
mod composable;
mod stages;
mod traits;

pub use async_map::AsyncMap;
pub use composable::{source, Composable, PipelineIter};
pub use stages::{Batched, Filter, Flatten, Map, Take, TryMap, ZipIndex};
pub use traits::{ItemStream, SourceKind, Stage, StageEnv};
