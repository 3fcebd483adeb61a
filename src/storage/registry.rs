//! Process-wide storage-engine registry

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::{StorageEngineConfig, StorageEngineHook};
use crate::event::BlockEvent;
use crate::status::Result;

type Factory = Arc<dyn Fn() -> Arc<dyn StorageEngineHook> + Send + Sync>;

static REGISTRY: OnceLock<Mutex<HashMap<String, Factory>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Factory>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register (or replace) the factory for `name`.
pub fn register_storage_engine(
    name: &str,
    factory: impl Fn() -> Arc<dyn StorageEngineHook> + Send + Sync + 'static,
) {
    registry()
        .lock()
        .insert(name.to_string(), Arc::new(factory));
}

/// Resolve an integration by name. Unknown names yield the no-op default,
/// whose `is_supported` returns false.
pub fn storage_engine(name: &str) -> Arc<dyn StorageEngineHook> {
    let factory = registry().lock().get(name).cloned();
    match factory {
        Some(factory) => factory(),
        None => Arc::new(NoopStorageEngine),
    }
}

/// Names currently registered.
pub fn registered_engines() -> Vec<String> {
    let mut names: Vec<String> = registry().lock().keys().cloned().collect();
    names.sort();
    names
}

/// Default integration: accepts every call, delivers nothing.
struct NoopStorageEngine;

impl StorageEngineHook for NoopStorageEngine {
    fn init(&self, _config: &StorageEngineConfig) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn install_interception(&self) -> Result<()> {
        Ok(())
    }

    fn uninstall_interception(&self) -> Result<()> {
        Ok(())
    }

    fn trigger_event(&self, _event: &BlockEvent) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> (u64, u64) {
        (0, 0)
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn engine_name(&self) -> &'static str {
        "default"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_name_resolves_to_unsupported_default() {
        let hook = storage_engine("no-such-engine");
        assert!(!hook.is_supported());
        assert_eq!(hook.engine_name(), "default");
        assert_eq!(hook.stats(), (0, 0));
        assert!(hook.init(&StorageEngineConfig::default()).is_ok());
    }

    #[test]
    fn registration_wins_over_default() {
        struct Probe;
        impl StorageEngineHook for Probe {
            fn init(&self, _: &StorageEngineConfig) -> Result<()> {
                Ok(())
            }
            fn shutdown(&self) {}
            fn install_interception(&self) -> Result<()> {
                Ok(())
            }
            fn uninstall_interception(&self) -> Result<()> {
                Ok(())
            }
            fn trigger_event(&self, _: &BlockEvent) -> Result<()> {
                Ok(())
            }
            fn stats(&self) -> (u64, u64) {
                (7, 0)
            }
            fn is_supported(&self) -> bool {
                true
            }
            fn engine_name(&self) -> &'static str {
                "probe"
            }
        }

        register_storage_engine("probe-registry-test", || Arc::new(Probe));
        let hook = storage_engine("probe-registry-test");
        assert!(hook.is_supported());
        assert_eq!(hook.stats(), (7, 0));
        assert!(registered_engines().contains(&"probe-registry-test".to_string()));
    }
}
