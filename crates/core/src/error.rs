/// Errors raised while loading or validating stack configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_config() {
        let err = Error::InvalidConfig("mtu below 68".to_string());
        assert_eq!(err.to_string(), "invalid configuration: mtu below 68");
    }

    #[test]
    fn error_display_missing_config() {
        let err = Error::MissingConfig("interfaces".to_string());
        assert_eq!(
            err.to_string(),
            "missing required configuration: interfaces"
        );
    }

    #[test]
    fn error_from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= nope").unwrap_err();
        let err: Error = toml_err.into();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().starts_with("failed to parse configuration"));
    }

    #[test]
    fn error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
