use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StompError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in {0:?}")]
    InvalidEscape(String),
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("frame ended before its headers were complete")]
    Truncated,
    #[error("frame is missing its NUL terminator")]
    MissingTerminator,
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect websocket {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("timed out waiting for the broker")]
    Timeout,
    #[error("broker rejected the session: {0}")]
    Rejected(String),
    #[error("broker closed the connection")]
    Closed,
    #[error("websocket failure: {0}")]
    Io(String),
    #[error("malformed frame: {0}")]
    Protocol(#[from] StompError),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid base url {0:?}: must be an absolute http:// or https:// url")]
    InvalidBaseUrl(String),
}
