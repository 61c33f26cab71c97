//! Layered settings.
//!
//! A [`Settings`] store holds any number of named dictionaries, each a JSON
//! object mapping setting names (`"workspace/container/alias"`,
//! `"app/fonts/default"`) to values. Lookups consult dictionaries from the
//! highest priority down and the first one defining the setting wins.
//! Dictionaries of equal priority are consulted most recently added first.

pub mod error;

use exn::ResultExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{ErrorKind, Result};

/// Where a settings dictionary came from, in increasing order of precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SettingsPriority {
    Defaults = 100,
    Application = 200,
    Organization = 300,
    ITwin = 400,
    IModel = 500,
}

/// A single named layer of settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Dictionary {
    pub name: String,
    pub priority: SettingsPriority,
    pub values: Map<String, Value>,
}

/// A thread-safe stack of settings dictionaries.
///
/// Nothing is cached across changes: adding or dropping a dictionary is
/// visible to the very next lookup.
#[derive(Debug, Default)]
pub struct Settings {
    // Sorted highest priority first.
    dictionaries: RwLock<Vec<Arc<Dictionary>>>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a dictionary, replacing any existing dictionary with the same name.
    pub fn add_dictionary(&self, name: impl Into<String>, priority: SettingsPriority, values: Map<String, Value>) {
        let dictionary = Arc::new(Dictionary { name: name.into(), priority, values });
        let mut dictionaries = self.dictionaries.write().unwrap_or_else(PoisonError::into_inner);
        dictionaries.retain(|d| d.name != dictionary.name);
        let at = dictionaries.iter().position(|d| d.priority <= priority).unwrap_or(dictionaries.len());
        tracing::debug!(name = %dictionary.name, ?priority, settings = dictionary.values.len(), "added settings dictionary");
        dictionaries.insert(at, dictionary);
    }

    /// Parse `json` and install it as a dictionary. The document must be an
    /// object; JSON5 comments, trailing commas and unquoted keys are accepted.
    pub fn add_json(&self, name: impl Into<String>, priority: SettingsPriority, json: &str) -> Result<()> {
        let name = name.into();
        let value: Value = json5::from_str(json).or_raise(|| ErrorKind::InvalidJson(name.clone()))?;
        let Value::Object(values) = value else {
            exn::bail!(ErrorKind::NotAnObject(name));
        };
        self.add_dictionary(name, priority, values);
        Ok(())
    }

    /// Read a JSON or JSON5 file and install it as a dictionary named after the path.
    pub fn add_file(&self, path: impl AsRef<Path>, priority: SettingsPriority) -> Result<()> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).or_raise(|| ErrorKind::Io(path.to_path_buf()))?;
        self.add_json(path.display().to_string(), priority, &json)
    }

    /// Remove a dictionary by name. Returns whether one was removed.
    pub fn drop_dictionary(&self, name: &str) -> bool {
        let mut dictionaries = self.dictionaries.write().unwrap_or_else(PoisonError::into_inner);
        let before = dictionaries.len();
        dictionaries.retain(|d| d.name != name);
        let dropped = dictionaries.len() != before;
        if dropped {
            tracing::debug!(name, "dropped settings dictionary");
        }
        dropped
    }

    /// Snapshot of the installed dictionaries, highest priority first.
    pub fn dictionaries(&self) -> Vec<Arc<Dictionary>> {
        self.dictionaries.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Walk every dictionary defining `name`, highest priority first, until
    /// `resolver` returns something.
    ///
    /// ```
    /// use serde_json::json;
    /// use stow_settings::{Settings, SettingsPriority};
    ///
    /// let settings = Settings::new();
    /// settings.add_json("low", SettingsPriority::Defaults, r#"{"limit": 5}"#).unwrap();
    /// settings.add_json("high", SettingsPriority::Application, r#"{"limit": "none"}"#).unwrap();
    /// // Skip values we can't use and fall through to lower priorities.
    /// let limit = settings.resolve_setting("limit", |value, _| value.as_u64());
    /// assert_eq!(limit, Some(5));
    /// ```
    pub fn resolve_setting<T>(
        &self,
        name: &str,
        mut resolver: impl FnMut(&Value, &Dictionary) -> Option<T>,
    ) -> Option<T> {
        self.dictionaries().iter().find_map(|d| d.values.get(name).and_then(|value| resolver(value, d)))
    }

    /// The highest-priority value of a setting.
    pub fn get_setting(&self, name: &str) -> Option<Value> {
        self.resolve_setting(name, |value, _| Some(value.clone()))
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get_setting(name).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get_setting(name).and_then(|v| v.as_bool())
    }

    pub fn get_number(&self, name: &str) -> Option<f64> {
        self.get_setting(name).and_then(|v| v.as_f64())
    }

    pub fn get_object(&self, name: &str) -> Option<Map<String, Value>> {
        match self.get_setting(name)? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn get_array(&self, name: &str) -> Option<Vec<Value>> {
        match self.get_setting(name)? {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Deserialize the highest-priority value of a setting.
    pub fn get_typed<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.get_setting(name)
            .map(|value| serde_json::from_value(value).or_raise(|| ErrorKind::WrongType(name.to_string())))
            .transpose()
    }
}
