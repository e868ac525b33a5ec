//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Every error found while loading one configuration.
#[derive(Debug, Error)]
#[error("{} configuration error(s):\n{}", .0.len(), render(.0))]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl ConfigErrors {
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }
}

impl From<ConfigError> for ConfigErrors {
    fn from(error: ConfigError) -> Self {
        Self(vec![error])
    }
}

fn render(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Accumulates errors so that a load reports all of them at once.
///
/// Passed explicitly to every parsing step that can fail.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Vec<ConfigError>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, error: ConfigError) {
        self.errors.push(error);
    }

    /// Keep the value of a successful step, record the error of a failed one.
    pub fn collect<T>(&mut self, result: ConfigResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.add(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `value` if nothing was collected.
    pub fn finish<T>(self, value: T) -> Result<T, ConfigErrors> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(ConfigErrors(self.errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_keeps_every_error() {
        let mut errors = ErrorCollector::new();
        assert_eq!(errors.collect::<u32>(Ok(3)), Some(3));
        assert_eq!(
            errors.collect::<u32>(Err(ConfigError::MissingField("a".into()))),
            None
        );
        errors.add(ConfigError::Duplicate("b".into()));
        assert_eq!(errors.len(), 2);

        let err = errors.finish(()).unwrap_err();
        assert_eq!(err.errors().len(), 2);
        let message = err.to_string();
        assert!(message.starts_with("2 configuration error(s)"));
        assert!(message.contains("missing required field: a"));
        assert!(message.contains("duplicate definition: b"));
    }

    #[test]
    fn test_empty_collector_finishes() {
        assert_eq!(ErrorCollector::new().finish(7).unwrap(), 7);
    }
}
