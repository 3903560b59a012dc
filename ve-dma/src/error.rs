#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("argument is invalid")]
    InvalidArgument,
    #[error("virtual to physical translation failed")]
    Fault,
    #[error("engine is busy")]
    Busy,
    #[error("request timed out")]
    TimedOut,
    #[error("request was canceled")]
    Canceled,
    #[error("request not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Negated-errno convention used at the `ve-proto` ack boundary.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::InvalidArgument => libc::EINVAL,
            Error::Fault => libc::EFAULT,
            Error::Busy => libc::EBUSY,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Canceled => libc::ECANCELED,
            Error::NotFound => libc::ESRCH,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
