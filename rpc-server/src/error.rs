use cardreader::CardreaderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("stats encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("core error: {0}")]
    Core(#[from] CardreaderError),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("no reader session; send Create first")]
    NoSession,
    #[error("reader session already exists")]
    SessionExists,
    #[error("host hook {0} not available")]
    HookUnavailable(&'static str),
    #[error("secure processor error: {0}")]
    See(String),
}
