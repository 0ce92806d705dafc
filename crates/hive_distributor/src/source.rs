//! Key/value configuration sources.
//!
//! [`DistributorConfig::from_source`](crate::DistributorConfig::from_source)
//! reads the `net.*` keys through the [`ConfigurationSource`] trait. Typed
//! getters fall back to the supplied default when a key is absent or its
//! value does not parse.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

pub trait ConfigurationSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);

    fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(value) if !value.is_empty() => value,
            _ => default.to_string(),
        }
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        parse_or(self.get(key), key, default)
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        parse_or(self.get(key), key, default)
    }

    /// `true` (any case) is true, anything else present is false.
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => value.trim().eq_ignore_ascii_case("true"),
            None => default,
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> T {
    let Some(value) = value else {
        return default;
    };
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!("Ignoring unparsable value for {key}: {value:?}");
            default
        }
    }
}

/// A thread-safe map.
#[derive(Debug, Default)]
pub struct InMemoryConfigurationSource {
    values: RwLock<BTreeMap<String, String>>,
}

impl InMemoryConfigurationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: RwLock::new(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }
}

impl ConfigurationSource for InMemoryConfigurationSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }
}

/// A `.properties` file: `key=value` or `key: value` per line, `#` and `!`
/// start comments, keys with empty values are skipped.
#[derive(Debug)]
pub struct PropertiesConfigurationSource {
    path: Option<PathBuf>,
    inner: InMemoryConfigurationSource,
}

impl PropertiesConfigurationSource {
    pub fn load(path: &Path) -> io::Result<Self> {
        info!("Loading settings from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let mut source = Self::parse(&text);
        source.path = Some(path.to_path_buf());
        info!("Loaded {} entries", source.inner.len());
        Ok(source)
    }

    pub fn parse(text: &str) -> Self {
        let inner = InMemoryConfigurationSource::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some(split) = line.find(['=', ':']) else {
                continue;
            };
            let key = line[..split].trim();
            let value = line[split + 1..].trim();
            if key.is_empty() || value.is_empty() {
                continue;
            }
            debug!("{key}={value}");
            inner.set(key, value);
        }
        Self { path: None, inner }
    }

    /// The file this source was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Write every entry as `key=value`, sorted by key.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        for key in self.inner.keys() {
            if let Some(value) = self.inner.get(&key) {
                let _ = writeln!(out, "{key}={value}");
            }
        }
        std::fs::write(path, out)
    }
}

impl ConfigurationSource for PropertiesConfigurationSource {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) {
        self.inner.set(key, value);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
