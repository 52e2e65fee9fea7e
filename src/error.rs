use std::{fmt, io, path::StripPrefixError};

use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError as TokioSendError;

#[cfg(feature = "service")]
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};

use crate::messages::Message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum PediaError {
    #[error("Build cache error: {0}")]
    Cache(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("TeX engine error: {0}")]
    Engine(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Build operation cancelled")]
    OperationCancelled,
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("Cross-reference resolution failed with {0} error(s)")]
    Resolution(usize),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Service error: {0}")]
    Service(String),
    #[error("Build failed: {0}")]
    BuildFailed(String),
}

impl From<StripPrefixError> for PediaError {
    fn from(src: StripPrefixError) -> PediaError {
        PediaError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for PediaError {
    fn from(src: toml::de::Error) -> PediaError {
        PediaError::Config(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for PediaError {
    fn from(src: toml::ser::Error) -> PediaError {
        PediaError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for PediaError {
    fn from(src: JsonError) -> PediaError {
        PediaError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for PediaError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => PediaError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => PediaError::PermissionDenied,
            _ => PediaError::Io(format!("IOError: {x}")),
        }
    }
}

impl From<fmt::Error> for PediaError {
    fn from(x: fmt::Error) -> Self {
        PediaError::Serialization(format!("{x}"))
    }
}

impl From<walkdir::Error> for PediaError {
    fn from(x: walkdir::Error) -> Self {
        match x.into_io_error() {
            Some(io_error) => io_error.into(),
            None => PediaError::Io("filesystem loop detected while scanning inputs".to_string()),
        }
    }
}

impl From<sqlx::Error> for PediaError {
    fn from(db_error: sqlx::Error) -> Self {
        PediaError::Cache(format!("database error: {db_error:?}"))
    }
}

impl From<sqlx::migrate::MigrateError> for PediaError {
    fn from(db_error: sqlx::migrate::MigrateError) -> Self {
        PediaError::Cache(format!("database migration error: {db_error}"))
    }
}

impl From<TokioSendError<Message>> for PediaError {
    fn from(x: TokioSendError<Message>) -> Self {
        PediaError::Service(format!(
            "Channel send error, could not transmit build message {}",
            x.0.kind()
        ))
    }
}

impl From<tokio::task::JoinError> for PediaError {
    fn from(x: tokio::task::JoinError) -> Self {
        if x.is_cancelled() {
            PediaError::OperationCancelled
        } else {
            PediaError::Service(format!("worker task panicked: {x}"))
        }
    }
}

#[cfg(feature = "service")]
impl From<NotifyError> for PediaError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => PediaError::Service(format!(
                "notify-debouncer: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => PediaError::Io(format!(
                "notify-debouncer: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => PediaError::NotFound(format!(
                "notify-debouncer: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => PediaError::NotFound(format!(
                "notify-debouncer: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                PediaError::Service("notify-debouncer invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                PediaError::Service("notify-debouncer max file watch limit reached".to_string())
            }
        }
    }
}
