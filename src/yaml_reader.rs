use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use serde_yaml::{value::TaggedValue, Mapping, Value};

/// Bound on substitution rounds applied to a single string. Only reachable
/// when an environment value refers back to itself.
const MAX_SUBSTITUTION_ROUNDS: usize = 64;

/// `${NAME}` or `${NAME:DEFAULT}`. The default cannot contain `$`, `{` or `}`
/// so the innermost token of a nested expression always matches first.
fn env_token() -> &'static Regex {
    static ENV_TOKEN: OnceLock<Regex> = OnceLock::new();
    ENV_TOKEN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z0-9_\-]+)(?::([^${}]*))?\}")
            .expect("environment token pattern is valid")
    })
}

#[derive(Debug, thiserror::Error)]
#[error("Error reading YAML file: {} - {kind}", .path.display())]
pub struct UnableToReadYamlFileError {
    pub path: PathBuf,
    #[source]
    pub kind: YamlReadErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum YamlReadErrorKind {
    #[error("file not found")]
    NotFound,
    #[error("unable to read file: {0}")]
    Io(#[from] io::Error),
    #[error("unable to parse yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("value at `{key}` is not a mapping")]
    NotAMapping { key: String },
    #[error("environment substitution does not terminate for `{value}`")]
    SubstitutionLimit { value: String },
}

/// Reads a yaml file into a mapping, optionally descending into a dotted base
/// key and resolving `${NAME:DEFAULT}` tokens against the process environment.
#[derive(Clone, Debug)]
pub struct YamlFileReader {
    file_path: PathBuf,
    base_key: Option<String>,
    use_environment_injection: bool,
}

impl YamlFileReader {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            base_key: None,
            use_environment_injection: true,
        }
    }

    /// Dot separated path to the section to return, `"a.b"` reads `data["a"]["b"]`.
    pub fn base_key(mut self, base_key: impl Into<String>) -> Self {
        self.base_key = Some(base_key.into());
        self
    }

    pub fn environment_injection(mut self, enabled: bool) -> Self {
        self.use_environment_injection = enabled;
        self
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// A base key that is absent from the document yields an empty mapping,
    /// so a schema with only optional fields still builds from its defaults.
    pub fn read(&self) -> Result<Mapping, UnableToReadYamlFileError> {
        self.read_section().map_err(|kind| UnableToReadYamlFileError {
            path: self.file_path.clone(),
            kind,
        })
    }

    fn read_section(&self) -> Result<Mapping, YamlReadErrorKind> {
        let data = self.filter_data_with_base_key(self.read_yaml_file()?)?;
        if !self.use_environment_injection {
            return Ok(data);
        }
        into_mapping(
            inject_environment_variables(Value::Mapping(data))?,
            "document root",
        )
    }

    fn read_yaml_file(&self) -> Result<Value, YamlReadErrorKind> {
        if !self.file_path.exists() {
            return Err(YamlReadErrorKind::NotFound);
        }
        let content = fs::read_to_string(&self.file_path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    fn filter_data_with_base_key(&self, data: Value) -> Result<Mapping, YamlReadErrorKind> {
        let Some(base_key) = self.base_key.as_deref() else {
            return into_mapping(data, "document root");
        };
        let mut current = data;
        let mut walked = String::new();
        for segment in base_key.split('.') {
            let mut section = into_mapping(
                current,
                if walked.is_empty() { "document root" } else { walked.as_str() },
            )?;
            match section.remove(segment) {
                Some(value) => current = value,
                None => {
                    tracing::debug!(
                        "Base key `{segment}` of `{base_key}` not found in {}, using an empty section",
                        self.file_path.display()
                    );
                    return Ok(Mapping::new());
                }
            }
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(segment);
        }
        into_mapping(current, base_key)
    }
}

fn into_mapping(value: Value, key: &str) -> Result<Mapping, YamlReadErrorKind> {
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(YamlReadErrorKind::NotAMapping { key: key.into() }),
    }
}

/// Resolves environment tokens in every string value, recursing through
/// mappings and sequences. Keys are left untouched.
pub fn inject_environment_variables(value: Value) -> Result<Value, YamlReadErrorKind> {
    inject_environment_variables_with(value, &|name| env::var(name).ok())
}

pub fn inject_environment_variables_with<F>(
    value: Value,
    lookup: &F,
) -> Result<Value, YamlReadErrorKind>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(match value {
        Value::Mapping(mapping) => Value::Mapping(
            mapping
                .into_iter()
                .map(|(key, value)| Ok((key, inject_environment_variables_with(value, lookup)?)))
                .collect::<Result<Mapping, YamlReadErrorKind>>()?,
        ),
        Value::Sequence(sequence) => Value::Sequence(
            sequence
                .into_iter()
                .map(|value| inject_environment_variables_with(value, lookup))
                .collect::<Result<_, _>>()?,
        ),
        Value::String(text) => match substitute(&text, lookup)? {
            Some(substituted) => Value::String(substituted),
            None => Value::String(text),
        },
        Value::Tagged(tagged) => {
            let TaggedValue { tag, value } = *tagged;
            Value::Tagged(Box::new(TaggedValue {
                tag,
                value: inject_environment_variables_with(value, lookup)?,
            }))
        }
        scalar => scalar,
    })
}

/// Returns `None` when the text holds no token.
pub fn substitute<F>(text: &str, lookup: &F) -> Result<Option<String>, YamlReadErrorKind>
where
    F: Fn(&str) -> Option<String>,
{
    let mut current = text.to_owned();
    let mut rounds = 0;
    while let Some(captures) = env_token().captures(&current) {
        if rounds == MAX_SUBSTITUTION_ROUNDS {
            return Err(YamlReadErrorKind::SubstitutionLimit { value: text.into() });
        }
        rounds += 1;
        let token = captures[0].to_owned();
        let replacement = lookup(&captures[1])
            .unwrap_or_else(|| captures.get(2).map_or("", |m| m.as_str()).to_owned());
        current = current.replace(&token, &replacement);
    }
    Ok((rounds > 0).then_some(current))
}
