//! YAML-backed process configuration.
//!
//! Mirrors the original runtime's `ConfigVar<T>` / `Config::Lookup`
//! design: every tunable is registered once under a dotted, lowercased
//! name with a default value and a description, read through an
//! [`std::sync::Arc`] handle, and can be bulk-updated by loading a YAML
//! document. Every successful update runs the variable's change
//! listeners with `(old, new)`, which is how [`crate::hook`] keeps its
//! lock-free `tcp.connect.timeout` atomic in sync with the registry.
//!
//! Two variables are defined by this crate itself: [`fiber_stack_size`]
//! and [`tcp_connect_timeout`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::sync::{Mutex, RwLock};

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// A single named, typed, hot-reloadable configuration value.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns a clone of the current value. Cheap for the `u32`/`i64`
    /// style scalars this crate actually registers.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Installs a new value, running change listeners if it differs from
    /// the previous one. A no-op (and no listener calls) if the value is
    /// unchanged.
    pub fn set(&self, new_value: T) {
        let old_value = {
            let mut guard = self.value.write();
            if *guard == new_value {
                return;
            }
            std::mem::replace(&mut *guard, new_value.clone())
        };
        for listener in self.listeners.lock().iter() {
            listener(&old_value, &new_value);
        }
    }

    /// Registers a listener invoked with `(old, new)` on every change.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }
}

/// Applies a parsed YAML value to a variable without the registry itself
/// needing to be generic over `T`.
trait YamlSettable: Send + Sync {
    fn set_from_yaml(&self, value: &serde_yaml::Value) -> Result<(), serde_yaml::Error>;
}

impl<T> YamlSettable for ConfigVar<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn set_from_yaml(&self, value: &serde_yaml::Value) -> Result<(), serde_yaml::Error> {
        let parsed: T = serde_yaml::from_value(value.clone())?;
        self.set(parsed);
        Ok(())
    }
}

/// A registered variable, erased two ways: as [`Any`] so [`Config::lookup`]
/// can recover the concrete `Arc<ConfigVar<T>>`, and as [`YamlSettable`] so
/// [`Config::load_from_yaml`] can update it without knowing `T`. Both
/// trait objects are coercions of the same underlying `Arc<ConfigVar<T>>`.
struct Entry {
    any: Arc<dyn Any + Send + Sync>,
    yaml: Arc<dyn YamlSettable>,
}

static REGISTRY: Lazy<Mutex<HashMap<String, Entry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-wide typed configuration registry.
pub struct Config;

impl Config {
    /// Looks up an existing variable by name, or registers one with the
    /// given default and description. Subsequent lookups with the same
    /// name and type return the same handle; a lookup with a mismatched
    /// type is a caller bug and is fatal, matching the invariant-violation
    /// policy used elsewhere in the crate.
    pub fn lookup<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
    where
        T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + Debug + 'static,
    {
        let key = name.to_lowercase();
        let mut registry = REGISTRY.lock();
        if let Some(existing) = registry.get(&key) {
            return existing.any.clone().downcast::<ConfigVar<T>>().unwrap_or_else(|_| {
                crate::log::fatal(&format!(
                    "config var '{key}' looked up at a different type than it was registered with"
                ))
            });
        }
        let var = Arc::new(ConfigVar {
            name: key.clone(),
            description: description.to_string(),
            value: RwLock::new(default),
            listeners: Mutex::new(Vec::new()),
        });
        registry.insert(
            key,
            Entry {
                any: var.clone(),
                yaml: var.clone(),
            },
        );
        var
    }

    /// Parses `yaml` as a document of (possibly nested) dotted keys and
    /// applies every value whose dotted path matches a registered
    /// variable. Unknown keys are ignored, matching the original
    /// runtime's tolerant reload behavior.
    pub fn load_from_yaml(yaml: &str) -> Result<(), serde_yaml::Error> {
        let root: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let mut flattened = HashMap::new();
        flatten_yaml(String::new(), &root, &mut flattened);

        let registry = REGISTRY.lock();
        for (key, value) in flattened {
            if let Some(entry) = registry.get(&key) {
                entry.yaml.set_from_yaml(&value)?;
            }
        }
        Ok(())
    }
}

fn flatten_yaml(prefix: String, value: &serde_yaml::Value, out: &mut HashMap<String, serde_yaml::Value>) {
    if let serde_yaml::Value::Mapping(map) = value {
        for (k, v) in map {
            let Some(k) = k.as_str() else { continue };
            let key = if prefix.is_empty() {
                k.to_lowercase()
            } else {
                format!("{prefix}.{}", k.to_lowercase())
            };
            if matches!(v, serde_yaml::Value::Mapping(_)) {
                flatten_yaml(key, v, out);
            } else {
                out.insert(key, v.clone());
            }
        }
    } else {
        out.insert(prefix, value.clone());
    }
}

static FIBER_STACK_SIZE: Lazy<Arc<ConfigVar<u32>>> =
    Lazy::new(|| Config::lookup("fiber.stack_size", 128 * 1024, "fiber stack size in bytes"));

static TCP_CONNECT_TIMEOUT: Lazy<Arc<ConfigVar<i64>>> =
    Lazy::new(|| Config::lookup("tcp.connect.timeout", 5000, "tcp connect timeout in ms"));

/// The `fiber.stack_size` configuration variable (default 131072 bytes).
pub fn fiber_stack_size() -> Arc<ConfigVar<u32>> {
    FIBER_STACK_SIZE.clone()
}

/// The `tcp.connect.timeout` configuration variable (default 5000 ms).
pub fn tcp_connect_timeout() -> Arc<ConfigVar<i64>> {
    TCP_CONNECT_TIMEOUT.clone()
}
