use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("malformed packet: {len} bytes")]
    MalformedPacket { len: usize },

    #[error("config error: {0}")]
    Config(String),

    #[error("other: {0}")]
    Other(String),
}

impl From<serde_json::Error> for ConnectorError {
    fn from(e: serde_json::Error) -> Self {
        ConnectorError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
