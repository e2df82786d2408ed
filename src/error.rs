use std::result::Result as StdResult;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bson encode failed: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("bson decode failed: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown op code {0}")]
    UnknownOpcode(i32),

    #[error("expected to receive {expected}, got nothing after {timeout:?}")]
    ReceiveTimeout { expected: String, timeout: Duration },

    #[error("expected to receive {expected}, got {actual}")]
    UnexpectedRequest { expected: String, actual: String },

    #[error("server stopped")]
    ServerStopped,

    #[error("connection {0} is gone")]
    ConnectionGone(u64),

    #[error("request {0} was already replied to")]
    AlreadyReplied(i32),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = StdResult<T, Error>;
