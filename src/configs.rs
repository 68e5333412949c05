use std::{
    borrow::Cow,
    env, fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{
    de::{self, DeserializeOwned},
    Deserialize, Deserializer,
};
use serde_yaml::{Mapping, Value};

use crate::yaml_reader::{UnableToReadYamlFileError, YamlFileReader};

/// The file read by the application, the plugin manager and the plugins.
pub const APPLICATION_CONFIG_FILENAME: &str = "application.yaml";

/// Extra roots searched for package directories, in the platform's path list
/// syntax. The current directory is always searched last.
pub const PACKAGE_SEARCH_PATH_VAR: &str = "APP_FACTORY_PATH";

#[derive(Debug, thiserror::Error)]
pub enum PackageResourceError {
    #[error("the package name must be set")]
    PackageNameUnset,
    #[error("package `{package}` not found, searched: {searched:?}")]
    PackageNotFound {
        package: String,
        searched: Vec<PathBuf>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigSourceError {
    #[error(transparent)]
    Package(#[from] PackageResourceError),
    #[error(transparent)]
    Yaml(#[from] UnableToReadYamlFileError),
}

/// Separates "the file could not be found or parsed" from "the file was read
/// but its content does not fit the model".
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read the configuration file: {0}")]
    UnableToReadConfigFile(#[source] ConfigSourceError),
    #[error("unable to create the configuration model: {0}")]
    ValueErrorConfig(#[source] serde_yaml::Error),
}

impl From<PackageResourceError> for ConfigError {
    fn from(e: PackageResourceError) -> Self {
        Self::UnableToReadConfigFile(e.into())
    }
}

impl From<UnableToReadYamlFileError> for ConfigError {
    fn from(e: UnableToReadYamlFileError) -> Self {
        Self::UnableToReadConfigFile(e.into())
    }
}

/// A named bundle of resources, such as `application.yaml`.
///
/// The dotted name maps onto nested directories (`books.service` lives in
/// `books/service`). Without an explicit root, the directory is looked up in
/// [`PACKAGE_SEARCH_PATH_VAR`] and then in the current directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
    name: Cow<'static, str>,
    root: Option<PathBuf>,
}

impl Package {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            root: None,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            root: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unset(&self) -> bool {
        self.name.trim().is_empty()
    }

    pub fn locate(&self) -> Result<PathBuf, PackageResourceError> {
        if self.is_unset() {
            return Err(PackageResourceError::PackageNameUnset);
        }
        let relative: PathBuf = self.name.split('.').collect();
        let roots = match &self.root {
            Some(root) => vec![root.clone()],
            None => search_path(),
        };
        roots
            .iter()
            .map(|root| root.join(&relative))
            .find(|candidate| candidate.is_dir())
            .ok_or_else(|| PackageResourceError::PackageNotFound {
                package: self.name.to_string(),
                searched: roots.clone(),
            })
    }

    /// Path of a file inside the package. The file itself may not exist.
    pub fn file(&self, filename: impl AsRef<Path>) -> Result<PathBuf, PackageResourceError> {
        Ok(self.locate()?.join(filename))
    }
}

fn search_path() -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = env::var_os(PACKAGE_SEARCH_PATH_VAR)
        .map(|paths| env::split_paths(&paths).collect())
        .unwrap_or_default();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    roots
}

/// Locate `filename` in the package, read the section under `base_key` with
/// environment injection, and deserialize it.
pub fn build_config_from_file_in_package<C: DeserializeOwned>(
    package: &Package,
    filename: &str,
    base_key: &str,
) -> Result<C, ConfigError> {
    build_config_from_file(package.file(filename)?, base_key)
}

pub fn build_config_from_file<C: DeserializeOwned>(
    path: impl Into<PathBuf>,
    base_key: &str,
) -> Result<C, ConfigError> {
    let content = YamlFileReader::new(path)
        .base_key(base_key)
        .environment_injection(true)
        .read()?;
    build_config_from_mapping(content)
}

pub fn build_config_from_mapping<C: DeserializeOwned>(mapping: Mapping) -> Result<C, ConfigError> {
    serde_yaml::from_value(Value::Mapping(mapping)).map_err(ConfigError::ValueErrorConfig)
}

/// Field deserializer accepting either the typed value or its text.
///
/// Environment substitution always produces strings, so `port: ${PORT:8000}`
/// reaches the model as `"8000"`. Fields that are not strings opt in with
/// `#[serde(deserialize_with = "from_str_or_value")]`.
pub fn from_str_or_value<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ValueOrText<T> {
        Value(T),
        Text(String),
    }

    match ValueOrText::<T>::deserialize(deserializer)? {
        ValueOrText::Value(value) => Ok(value),
        ValueOrText::Text(text) => text.trim().parse().map_err(|e| {
            de::Error::custom(format_args!("invalid value `{text}`: {e}"))
        }),
    }
}
