#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("message too large ({0} bytes)")]
    TooLarge(u32),
    #[error("unknown command id {0}")]
    UnknownCommand(u32),
    #[error("truncated or malformed payload")]
    Malformed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::TooLarge(_) | Error::UnknownCommand(_) | Error::Malformed => libc::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
