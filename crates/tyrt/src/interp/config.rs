//! Interpreter isolation settings.
//!
//! A config is a plain value: it is built from a named preset or from an
//! attribute mapping, copied into the interpreter at creation and reported
//! back by `get_config`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    exception::{ExcType, Exception},
    value::Value,
};

/// How an interpreter shares the global interpreter lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GilMode {
    #[default]
    Default,
    Shared,
    Own,
}

/// Isolation parameters of one interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    pub use_main_obmalloc: bool,
    pub allow_fork: bool,
    pub allow_exec: bool,
    pub allow_threads: bool,
    pub allow_daemon_threads: bool,
    pub check_multi_interp_extensions: bool,
    pub gil: GilMode,
}

/// Field names in attribute-mapping order.
const BOOL_FIELDS: [&str; 6] = [
    "use_main_obmalloc",
    "allow_fork",
    "allow_exec",
    "allow_threads",
    "allow_daemon_threads",
    "check_multi_interp_extensions",
];

/// A config could not be built or is not usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported config name '{0}'")]
    UnsupportedName(String),
    #[error("unsupported interpreter config .gil value '{0}'")]
    UnsupportedGil(String),
    #[error("missing config key: {0}")]
    Missing(&'static str),
    #[error("invalid config type: {0}")]
    InvalidType(&'static str),
    /// Keys that name no field, already rendered as "N extra item(s) (keys)".
    #[error("config dict has {0}")]
    ExtraItems(String),
    /// The combination of settings cannot be honored.
    #[error("{0}")]
    Unsupported(&'static str),
}

fn extra_items(count: usize, keys: &str) -> String {
    if count == 1 {
        format!("1 extra item ({keys})")
    } else {
        format!("{count} extra items ({keys})")
    }
}

impl From<ConfigError> for Exception {
    fn from(err: ConfigError) -> Self {
        let exc_type = match err {
            ConfigError::InvalidType(_) => ExcType::TypeError,
            ConfigError::Unsupported(_) => ExcType::InterpreterError,
            _ => ExcType::ValueError,
        };
        Self::new(exc_type, err.to_string())
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self::isolated()
    }
}

impl InterpreterConfig {
    /// Fully isolated: own allocator, own GIL, no fork or exec.
    #[must_use]
    pub fn isolated() -> Self {
        Self {
            use_main_obmalloc: false,
            allow_fork: false,
            allow_exec: false,
            allow_threads: true,
            allow_daemon_threads: false,
            check_multi_interp_extensions: true,
            gil: GilMode::Own,
        }
    }

    /// Behaves like interpreters created through the old C-API.
    #[must_use]
    pub fn legacy() -> Self {
        Self {
            use_main_obmalloc: true,
            allow_fork: true,
            allow_exec: true,
            allow_threads: true,
            allow_daemon_threads: true,
            check_multi_interp_extensions: false,
            gil: GilMode::Shared,
        }
    }

    /// Everything off.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            use_main_obmalloc: false,
            allow_fork: false,
            allow_exec: false,
            allow_threads: false,
            allow_daemon_threads: false,
            check_multi_interp_extensions: false,
            gil: GilMode::Default,
        }
    }

    /// The preset called `name`. `None`, `""` and `"default"` mean `isolated`.
    pub fn named(name: Option<&str>) -> Result<Self, ConfigError> {
        match name.unwrap_or("isolated") {
            "" | "default" | "isolated" => Ok(Self::isolated()),
            "legacy" => Ok(Self::legacy()),
            "empty" => Ok(Self::empty()),
            other => Err(ConfigError::UnsupportedName(other.to_owned())),
        }
    }

    /// Builds a config from a mapping that must name every field.
    pub fn from_attrs(attrs: &IndexMap<String, Value>) -> Result<Self, ConfigError> {
        let mut config = Self::empty();
        config.apply_attrs(attrs, false)?;
        Ok(config)
    }

    /// Overrides the fields present in `attrs`.
    pub fn update_from_attrs(&mut self, attrs: &IndexMap<String, Value>) -> Result<(), ConfigError> {
        self.apply_attrs(attrs, true)
    }

    fn apply_attrs(&mut self, attrs: &IndexMap<String, Value>, missing_allowed: bool) -> Result<(), ConfigError> {
        let mut updated = self.clone();
        let mut used = 0;
        for name in BOOL_FIELDS {
            match attrs.get(name) {
                Some(Value::Bool(flag)) => {
                    *updated.flag_mut(name) = *flag;
                    used += 1;
                }
                Some(_) => return Err(ConfigError::InvalidType(name)),
                None if missing_allowed => {}
                None => return Err(ConfigError::Missing(name)),
            }
        }
        match attrs.get("gil") {
            Some(Value::Str(gil)) => {
                updated.gil = gil.parse().map_err(|_| ConfigError::UnsupportedGil(gil.clone()))?;
                used += 1;
            }
            Some(_) => return Err(ConfigError::InvalidType("gil")),
            None if missing_allowed => {}
            None => return Err(ConfigError::Missing("gil")),
        }
        if attrs.len() > used {
            let keys = attrs
                .keys()
                .filter(|key| key.as_str() != "gil" && !BOOL_FIELDS.contains(&key.as_str()))
                .map(|key| Value::str(key.as_str()).repr())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConfigError::ExtraItems(extra_items(attrs.len() - used, &keys)));
        }
        *self = updated;
        Ok(())
    }

    fn flag_mut(&mut self, name: &str) -> &mut bool {
        match name {
            "use_main_obmalloc" => &mut self.use_main_obmalloc,
            "allow_fork" => &mut self.allow_fork,
            "allow_exec" => &mut self.allow_exec,
            "allow_threads" => &mut self.allow_threads,
            "allow_daemon_threads" => &mut self.allow_daemon_threads,
            _ => &mut self.check_multi_interp_extensions,
        }
    }

    /// The config as an ordered attribute mapping.
    #[must_use]
    pub fn to_attrs(&self) -> IndexMap<String, Value> {
        let flags = [
            self.use_main_obmalloc,
            self.allow_fork,
            self.allow_exec,
            self.allow_threads,
            self.allow_daemon_threads,
            self.check_multi_interp_extensions,
        ];
        let mut attrs: IndexMap<String, Value> = BOOL_FIELDS
            .iter()
            .zip(flags)
            .map(|(name, flag)| ((*name).to_owned(), Value::Bool(flag)))
            .collect();
        attrs.insert("gil".to_owned(), Value::str(<&str>::from(self.gil)));
        attrs
    }

    /// Checks that an interpreter can actually be created with these settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.use_main_obmalloc && !self.check_multi_interp_extensions {
            return Err(ConfigError::Unsupported(
                "per-interpreter obmalloc does not support single-phase init extension modules",
            ));
        }
        if self.gil == GilMode::Own && self.use_main_obmalloc {
            return Err(ConfigError::Unsupported(
                "per-interpreter GIL requires per-interpreter obmalloc",
            ));
        }
        Ok(())
    }

    /// The config as JSON, for persisting alongside host settings.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
