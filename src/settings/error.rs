use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file '{path}': {source}")]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("port range '{value}' for type '{tag}' contains no usable ports")]
    InvalidPortRange { tag: String, value: String },
    #[error("glob '{pattern}' for type '{tag}' is invalid: {reason}")]
    InvalidGlob {
        tag: String,
        pattern: String,
        reason: String,
    },
    #[error("install root is not set; export {var} or set `root` in the settings file")]
    MissingRoot { var: &'static str },
    #[error("install root '{0}' must be an absolute path")]
    RelativeRoot(PathBuf),
    #[error("cannot determine the default instance user")]
    MissingUser,
}

pub type SettingsResult<T> = Result<T, SettingsError>;
