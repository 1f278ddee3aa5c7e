//! `flag_engine` is the evaluation core of a feature flag SDK: given flag and segment
//! definitions and an evaluation context, it decides which variation the context gets and why.
//!
//! # Overview
//!
//! Flag and segment definitions arrive as plain data ([`models`]). Before use they are compiled
//! into [`FeatureFlag`] and [`Segment`], which carry precomputed results, target key sets and
//! pre-parsed clause values next to the data. Compilation happens once, on deserialization or
//! through [`FeatureFlag::new`]/[`Segment::new`], and compiled values are immutable afterwards,
//! so they can be shared between threads and evaluated concurrently without locking.
//!
//! [`Evaluator`](eval::Evaluator) evaluates a flag for a [`Context`]. It reads prerequisite flags,
//! segments and big segment memberships through the [`Getters`](eval::Getters) trait, and reports
//! every prerequisite evaluation to a [`PrerequisiteRecorder`](eval::PrerequisiteRecorder).
//! Evaluation is deterministic: percentage rollouts [bucket](bucketing) contexts by hashing their
//! key, so a context keeps its variation for as long as the flag doesn't change.
//!
//! The [`store`] module holds flags and segments. [`PersistentStore`](store::PersistentStore) is
//! the interface for external storage, with [`InMemoryStore`](store::InMemoryStore) as the
//! built-in implementation. [`CachingStoreWrapper`](store::CachingStoreWrapper) puts an in-memory
//! cache with a configurable [staleness policy](store::StalenessPolicy) in front of any store, and
//! [`StoreGetters`](store::StoreGetters) connects a store to the evaluator.
//! [`DependencyTracker`](store::DependencyTracker) knows which items reference which, for change
//! propagation and for writing data in dependency order.
//!
//! Segments with too many members to ship around are [big segments](big_segments): their
//! membership lives in an external [`BigSegmentStore`](big_segments::BigSegmentStore), read
//! through a caching [`BigSegmentStoreWrapper`](big_segments::BigSegmentStoreWrapper).
//!
//! # Error Handling
//!
//! Evaluation never fails. Problems with flag data (a missing prerequisite, a variation index out
//! of range, a prerequisite cycle) produce an [`EvalResult`](eval::EvalResult) with
//! [`Reason::Error`](eval::Reason::Error), and the caller falls back to its default value.
//!
//! Stores and context builders return [`Result`] with the [`Error`] enum.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with structured key-values
//! and the `flag_engine` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into evaluation and store operations.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod attribute_ref;
pub mod big_segments;
pub mod bucketing;
pub mod context;
pub mod eval;
pub mod models;
pub mod rules;
pub mod store;

mod compiled;
mod error;

pub use compiled::{preprocess_clause, ClausePreprocessed, FeatureFlag, Segment};
pub use context::{Context, ContextBuilder, MultiContextBuilder};
pub use error::{Error, Result, StoreError};

/// String type used for keys throughout the crate. Cheap to clone.
pub type Str = faststr::FastStr;
