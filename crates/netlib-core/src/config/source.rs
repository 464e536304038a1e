//! Typed configuration lookup.
//!
//! A [`ConfigSource`] hands out raw string values by name;
//! [`get_value`] parses them into any `FromStr` type, falling back to a
//! default when the name is absent or does not parse.
//!
//! ```ignore
//! use netlib_core::config::{get_value, EnvSource};
//!
//! let backlog: i32 = get_value(&EnvSource, "NETLIB_BACKLOG", 64);
//! ```

use std::collections::HashMap;
use std::str::FromStr;

/// Name → raw value store.
pub trait ConfigSource {
    fn raw(&self, name: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn raw(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// In-memory values, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MapSource {
    values: HashMap<String, String>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(name.into(), value.to_string());
        self
    }
}

impl ConfigSource for MapSource {
    fn raw(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Look up `name` and parse it as `T`, or return `default`.
#[inline]
pub fn get_value<T, S>(source: &S, name: &str, default: T) -> T
where
    T: FromStr,
    S: ConfigSource + ?Sized,
{
    source
        .raw(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
