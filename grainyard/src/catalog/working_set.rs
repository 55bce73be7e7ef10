//! Working-set tracking: which activations are live and collectible.

use crate::catalog::{Activation, ActivationCollector};
use crate::grain::GrainKind;
use std::rc::Rc;
use std::time::Instant;

/// Observer feeding the activation collector.
///
/// New Valid activations enter the wheel here; activity pushes their
/// ticket out lazily — only when the current ticket would fire within half
/// the age limit, so a busy activation is not re-bucketed on every call.
/// System targets are exempt: they never enter a bucket.
pub struct WorkingSet {
    collector: Rc<ActivationCollector>,
}

impl WorkingSet {
    pub fn new(collector: Rc<ActivationCollector>) -> Self {
        Self { collector }
    }

    /// A new activation reached Valid.
    pub fn observe_activated(&self, activation: &Rc<Activation>) {
        if activation.grain_kind() == GrainKind::SystemTarget {
            return;
        }
        self.collector.schedule(activation);
    }

    /// The activation served a call.
    pub fn observe_activity(&self, activation: &Rc<Activation>) {
        if activation.grain_kind() == GrainKind::SystemTarget {
            return;
        }
        // Re-bucket lazily: only when the current ticket would fire within
        // half the age limit. The sweep re-checks idleness anyway, so a
        // fired ticket losing this race is harmless.
        let Some(deadline) = self.collector.deadline_of(activation) else {
            return;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining * 2 < activation.age_limit() {
            self.collector.try_reschedule(activation);
        }
    }

    /// The activation left the working set.
    pub fn observe_removed(&self, activation: &Rc<Activation>) {
        self.collector.try_cancel(activation);
    }
}
