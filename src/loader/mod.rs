//! Generic loading of YAML resource files (integrations, chains, users,
//! schedules, webhooks).

use std::{
    fs,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, File, FileFormat};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Error when reading the configuration file.
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Error when parsing the configuration file.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// Error when the configuration format is unsupported.
    #[error("Unsupported configuration format")]
    UnsupportedFormat,
}

/// A generic loader for YAML files.
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    /// Creates a new `ConfigLoader`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Loads the list stored under the top-level `key`. A missing key is an
    /// error.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, LoaderError> {
        Ok(self.read()?.get(key)?)
    }

    /// Like [`ConfigLoader::load`], but a missing key yields an empty list.
    pub fn load_optional<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, LoaderError> {
        match self.read()?.get(key) {
            Ok(items) => Ok(items),
            Err(ConfigError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self) -> Result<Config, LoaderError> {
        if !self.is_yaml_file() {
            return Err(LoaderError::UnsupportedFormat);
        }
        let config_str = fs::read_to_string(&self.path)?;
        Ok(Config::builder().add_source(File::from_str(&config_str, FileFormat::Yaml)).build()?)
    }

    /// Checks if the file has a YAML extension.
    fn is_yaml_file(&self) -> bool {
        matches!(self.path.extension().and_then(|ext| ext.to_str()), Some("yaml") | Some("yml"))
    }
}

/// A trait for types that can be loaded from a configuration file.
pub trait Loadable: Sized + DeserializeOwned {
    /// The top-level key in the YAML file (e.g., "integrations").
    const KEY: &'static str;

    /// The specific error type for this loadable item.
    type Error: From<LoaderError>;

    /// Post-deserialization normalization and validation.
    fn validate(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Loads `T` from an optional resource file: a missing file or key yields an
/// empty list.
pub fn load_config_if_exists<T: Loadable>(path: &Path) -> Result<Vec<T>, T::Error> {
    if !path.exists() {
        tracing::info!(path = %path.display(), key = T::KEY, "Resource file not found, skipping.");
        return Ok(Vec::new());
    }
    let loader = ConfigLoader::new(path.to_path_buf());
    let mut items: Vec<T> = loader.load_optional(T::KEY)?;
    for item in &mut items {
        item.validate()?;
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use serde::Deserialize;
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestItem {
        name: String,
        value: i32,
    }

    impl Loadable for TestItem {
        type Error = LoaderError;

        const KEY: &'static str = "items";
    }

    fn create_test_file(dir: &TempDir, filename: &str, content: &str) -> PathBuf {
        let path = dir.path().join(filename);
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{}", content).unwrap();
        path
    }

    #[test]
    fn test_load_success() {
        let dir = TempDir::new().unwrap();
        let content = r#"
items:
  - name: "A"
    value: 1
  - name: "B"
    value: 2
"#;
        let path = create_test_file(&dir, "test.yaml", content);
        let items: Vec<TestItem> = ConfigLoader::new(path).load("items").unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], TestItem { name: "A".into(), value: 1 });
        assert_eq!(items[1], TestItem { name: "B".into(), value: 2 });
    }

    #[test]
    fn test_load_nonexistent_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nonexistent.yaml");
        let result: Result<Vec<TestItem>, _> = ConfigLoader::new(path).load("items");
        assert!(matches!(result.unwrap_err(), LoaderError::IoError(_)));
    }

    #[test]
    fn test_load_unsupported_format() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(&dir, "test.txt", "items: []");
        let result: Result<Vec<TestItem>, _> = ConfigLoader::new(path).load("items");
        assert!(matches!(result.unwrap_err(), LoaderError::UnsupportedFormat));
    }

    #[test]
    fn test_load_missing_top_level_key() {
        let dir = TempDir::new().unwrap();
        let content = r#"
wrong_key:
  - name: "A"
    value: 1
"#;
        let path = create_test_file(&dir, "test.yaml", content);
        let loader = ConfigLoader::new(path);

        let strict: Result<Vec<TestItem>, _> = loader.load("items");
        assert!(matches!(strict.unwrap_err(), LoaderError::ParseError(_)));

        let optional: Vec<TestItem> = loader.load_optional("items").unwrap();
        assert!(optional.is_empty());
    }

    #[test]
    fn test_load_config_if_exists_skips_missing_file() {
        let dir = TempDir::new().unwrap();
        let items: Vec<TestItem> =
            load_config_if_exists(&dir.path().join("absent.yaml")).unwrap();
        assert!(items.is_empty());
    }
}
