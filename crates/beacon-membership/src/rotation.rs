//! Rotation gate: operator override on top of health.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Shared in/out-of-rotation flag. Clones observe the same flag.
///
/// Changes take effect on the next aggregator cycle.
#[derive(Debug, Clone)]
pub struct RotationGate {
    in_rotation: Arc<AtomicBool>,
}

impl RotationGate {
    pub fn new(initial: bool) -> Self {
        Self {
            in_rotation: Arc::new(AtomicBool::new(initial)),
        }
    }

    /// Set the flag, returning the previous value.
    pub fn set_in_rotation(&self, in_rotation: bool) -> bool {
        let previous = self.in_rotation.swap(in_rotation, Ordering::SeqCst);
        if previous != in_rotation {
            info!(in_rotation, "rotation status changed");
        }
        previous
    }

    pub fn is_in_rotation(&self) -> bool {
        self.in_rotation.load(Ordering::SeqCst)
    }

    /// Combine with a health verdict into the publisher's target.
    pub fn target(&self, healthy: bool) -> bool {
        healthy && self.is_in_rotation()
    }
}

impl Default for RotationGate {
    fn default() -> Self {
        Self::new(true)
    }
}
