//! Flag evaluation.
//!
//! [`Evaluator`] evaluates compiled flags against a [`Context`](crate::Context), fetching
//! prerequisite flags, segments and big segment memberships through [`Getters`]. Evaluation never
//! fails: problems with flag data produce an [`EvalResult`] with [`Reason::Error`].
mod evaluator;
mod recorder;
mod result;

pub use evaluator::{Evaluator, Getters};
pub use recorder::{NoopRecorder, PrerequisiteEvent, PrerequisiteRecorder};
pub use result::{ErrorKind, EvalResult, Reason};
