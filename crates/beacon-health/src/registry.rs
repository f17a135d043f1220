//! Probe registry: name → probe, in registration order.

use std::sync::Arc;

use tracing::debug;

use crate::error::{HealthError, HealthResult};
use crate::probe::HealthProbe;

/// Probes registered during startup. Moved into the aggregator once
/// polling begins, so registration is closed from then on.
#[derive(Default, Clone)]
pub struct ProbeRegistry {
    probes: Vec<(String, Arc<dyn HealthProbe>)>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe under a unique name.
    pub fn register(&mut self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) -> HealthResult<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(HealthError::EmptyName);
        }
        if self.contains(&name) {
            return Err(HealthError::DuplicateProbe(name));
        }
        debug!(probe = %name, "health probe registered");
        self.probes.push((name, probe));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.probes.iter().any(|(n, _)| n == name)
    }

    /// Registered probes in registration order.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn HealthProbe>)> {
        self.probes.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.probes.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::HealthStatus;

    fn healthy() -> Arc<dyn HealthProbe> {
        Arc::new(|| HealthStatus::Healthy)
    }

    #[test]
    fn snapshot_keeps_registration_order() {
        let mut registry = ProbeRegistry::new();
        registry.register("zeta", healthy()).unwrap();
        registry.register("alpha", healthy()).unwrap();
        registry.register("mid", healthy()).unwrap();

        let names: Vec<String> = registry.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut registry = ProbeRegistry::new();
        registry.register("db", healthy()).unwrap();

        let err = registry.register("db", healthy()).unwrap_err();
        assert!(matches!(err, HealthError::DuplicateProbe(name) if name == "db"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_name_rejected() {
        let mut registry = ProbeRegistry::new();
        assert!(matches!(
            registry.register("", healthy()),
            Err(HealthError::EmptyName)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn same_probe_under_two_names_is_shared() {
        let probe = healthy();
        let mut registry = ProbeRegistry::new();
        registry.register("a", probe.clone()).unwrap();
        registry.register("b", probe.clone()).unwrap();

        let snapshot = registry.snapshot();
        assert!(Arc::ptr_eq(&snapshot[0].1, &snapshot[1].1));
    }
}
