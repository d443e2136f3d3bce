use thiserror::Error;

/// 统一错误类型。
///
/// 需要 `Clone`：一次 reload / 删除批次的结果会同时回复给多个等待方。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// 模板语法错误（未闭合的分隔符、空名字、相邻的非静态段）
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid keys length: expected {expected}, got {got}")]
    KeyLength { expected: usize, got: usize },

    #[error("pattern {0:?} has vars, fill requires a var-free pattern")]
    VarLength(String),

    #[error("invalid var {0:?}, expect one of none|number|timestamp")]
    InvalidVar(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("index {0:?} already exists")]
    AlreadyExists(String),

    #[error("index {0:?} not found")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("request timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("codec error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl Error {
    /// 冲突（索引已存在）在创建路径上视为成功
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }
}
