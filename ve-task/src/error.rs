#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such VE task")]
    NoSuchTask,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::NoSuchTask => libc::ESRCH,
            Error::InvalidArgument => libc::EINVAL,
            Error::NotPermitted => libc::EPERM,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
