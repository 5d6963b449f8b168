use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("background error: {0}")]
    Background(String),
}

impl Error {
    pub(crate) fn corruption(msg: impl Into<String>) -> Error {
        Error::Corruption(msg.into())
    }

    /// Sticky error slots keep a copy while the original is returned to the
    /// caller. `io::Error` is not `Clone`, so the copy degrades to a message.
    pub(crate) fn to_background(&self) -> Error {
        Error::Background(self.to_string())
    }
}
