use crate::{compiled::FeatureFlag, context::Context};

use super::EvalResult;

/// A prerequisite flag evaluated on the way to a result.
#[derive(Debug, Clone, Copy)]
pub struct PrerequisiteEvent<'a> {
    /// Flag that declares the prerequisite.
    pub target_flag_key: &'a str,
    pub prerequisite_flag: &'a FeatureFlag,
    pub context: &'a Context,
    pub result: &'a EvalResult,
}

/// Receives every prerequisite evaluation, whether or not the prerequisite was met.
///
/// Implemented for closures taking a [`PrerequisiteEvent`].
pub trait PrerequisiteRecorder {
    fn record(&mut self, event: PrerequisiteEvent<'_>);
}

/// Recorder that ignores all events.
///
/// It is designed so that all calls to it are optimized away.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl PrerequisiteRecorder for NoopRecorder {
    #[inline]
    fn record(&mut self, _event: PrerequisiteEvent<'_>) {}
}

impl<F: FnMut(PrerequisiteEvent<'_>)> PrerequisiteRecorder for F {
    fn record(&mut self, event: PrerequisiteEvent<'_>) {
        self(event)
    }
}
