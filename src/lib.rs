#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

//! An embeddable Bitcask-style append-only log key/value store: a single
//! directory of sequential data files plus an in-memory index of where each
//! live key's most recent record sits.

pub mod codec;
pub mod compaction;
pub mod engine;
pub mod error;
pub mod index;
pub mod rotation;
pub mod scheduler;

pub use codec::Codec;
pub use compaction::{CompactionReport, CompactionStats};
pub use engine::Engine;
pub use error::{Error, Result};
pub use rotation::RotationPolicy;
pub use scheduler::{CompactionCallback, CompactionScheduler};
