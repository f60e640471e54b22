use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SqlmeterError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("load error at {file}:{line}: {message}")]
    Load {
        file: String,
        line: usize,
        message: String,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("allocator error: {0}")]
    Alloc(String),

    #[error("client error: {0}")]
    Client(String),

    #[error("fleet error: {0}")]
    Fleet(String),

    #[error("stage not found: {0}")]
    StageNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Serialize for SqlmeterError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl SqlmeterError {
    pub fn load(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self::Load {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = SqlmeterError::Validation("missing generator".to_string());
        assert_eq!(err.to_string(), "validation error: missing generator");
    }

    #[test]
    fn load_error_includes_file_and_line() {
        let err = SqlmeterError::load("001.sql", 12, "unknown modifier");
        assert_eq!(
            err.to_string(),
            "load error at 001.sql:12: unknown modifier"
        );
    }

    #[test]
    fn serialize_produces_string() {
        let err = SqlmeterError::Internal("boom".to_string());
        let json = serde_json::to_string(&err).expect("serialize should succeed");
        assert_eq!(json, "\"internal error: boom\"");
    }

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SqlmeterError = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }
}
