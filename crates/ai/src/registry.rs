use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use taskforge_core::DomainType;

use crate::executor::TaskExecutor;
use crate::result::ConfigurationError;
use crate::simulated::SimulatedExecutor;

/// Domain → executor lookup, built once at startup.
///
/// There is no fallback executor: a task whose domain has no registration is
/// a deployment mistake and resolving it fails loudly.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<DomainType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new(executors: Vec<Arc<dyn TaskExecutor>>) -> Result<Self, ConfigurationError> {
        let mut map = HashMap::with_capacity(executors.len());
        for executor in executors {
            let domain = executor.domain();
            if map.insert(domain, executor).is_some() {
                return Err(ConfigurationError::DuplicateDomain(domain));
            }
        }
        Ok(Self { executors: map })
    }

    /// A simulated executor for every domain.
    pub fn simulated(latency: Duration) -> Self {
        let executors = DomainType::ALL
            .iter()
            .map(|domain| {
                Arc::new(SimulatedExecutor::new(*domain).with_latency(latency)) as Arc<dyn TaskExecutor>
            })
            .map(|executor| (executor.domain(), executor))
            .collect();
        Self { executors }
    }

    pub fn resolve(&self, domain: DomainType) -> Result<Arc<dyn TaskExecutor>, ConfigurationError> {
        self.executors
            .get(&domain)
            .cloned()
            .ok_or(ConfigurationError::UnregisteredDomain(domain))
    }
}

impl core::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<_> = self.executors.values().map(|e| e.name().to_string()).collect();
        names.sort();
        f.debug_struct("ExecutorRegistry").field("executors", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_registry_covers_every_domain() {
        let registry = ExecutorRegistry::simulated(Duration::ZERO);
        for domain in DomainType::ALL {
            assert_eq!(registry.resolve(*domain).unwrap().domain(), *domain);
        }
    }

    #[test]
    fn unknown_domain_is_a_configuration_error() {
        let only: Arc<dyn TaskExecutor> = Arc::new(SimulatedExecutor::new(DomainType::ComplianceCheck));
        let registry = ExecutorRegistry::new(vec![only]).unwrap();

        let err = registry.resolve(DomainType::MonitoringAlert).err().unwrap();
        assert_eq!(err, ConfigurationError::UnregisteredDomain(DomainType::MonitoringAlert));
        assert_eq!(
            err.to_string(),
            "No task executor registered for domain 'monitoring_alert'."
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let err = ExecutorRegistry::new(vec![
            Arc::new(SimulatedExecutor::new(DomainType::ContentCreation)) as Arc<dyn TaskExecutor>,
            Arc::new(SimulatedExecutor::new(DomainType::ContentCreation)) as Arc<dyn TaskExecutor>,
        ])
        .unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateDomain(DomainType::ContentCreation));
    }
}
