//! Deterministic release of long-lived components.
//!
//! Transports, policies, filter pipelines and schedulers are shared behind
//! `Arc`s, so dropping one handle does not end the component. `release()`
//! ends it explicitly: the flag flips exactly once and every later call on the
//! component fails with [`MeshError::UseAfterRelease`].

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{MeshError, MeshResult};

/// Liveness flag checked on entry to every component method.
#[derive(Debug)]
pub struct Liveness {
    component: &'static str,
    released: AtomicBool,
}

impl Liveness {
    #[must_use]
    pub const fn new(component: &'static str) -> Self {
        Self {
            component,
            released: AtomicBool::new(false),
        }
    }

    /// Fails with `UseAfterRelease` once the component has been released.
    pub fn ensure_live(&self) -> MeshResult<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(MeshError::UseAfterRelease {
                component: self.component,
            });
        }
        Ok(())
    }

    /// Marks the component released. Releasing twice is an error.
    pub fn release(&self) -> MeshResult<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(MeshError::UseAfterRelease {
                component: self.component,
            });
        }
        tracing::debug!(component = self.component, "Component released");
        Ok(())
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn component(&self) -> &'static str {
        self.component
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_until_released() {
        let liveness = Liveness::new("Transport");
        assert!(liveness.ensure_live().is_ok());
        assert!(!liveness.is_released());

        liveness.release().unwrap();
        assert!(liveness.is_released());

        let err = liveness.ensure_live().unwrap_err();
        assert!(err.is_release());
        assert!(format!("{err}").contains("Transport"));
    }

    #[test]
    fn release_happens_exactly_once() {
        let liveness = Liveness::new("QosPolicy");
        liveness.release().unwrap();
        assert!(liveness.release().unwrap_err().is_release());
    }
}
