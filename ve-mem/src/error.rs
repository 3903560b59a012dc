#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("argument is invalid")]
    InvalidArgument,
    #[error("dma transfer faulted")]
    Fault,
    #[error(transparent)]
    Dma(#[from] ve_dma::Error),
}

impl Error {
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::InvalidArgument => libc::EINVAL,
            Error::Fault => libc::EFAULT,
            Error::Dma(e) => e.to_errno(),
        }
    }
}

/// String-receive result codes, named after the reference's mnemonics.
#[derive(Debug, thiserror::Error)]
pub enum StringRecvError {
    #[error("no NUL byte found within the scanned window")]
    NullNotFound,
    #[error("destination buffer too small")]
    DstTooSmall,
    #[error("dma receive failed")]
    FailedToRecv(#[from] Error),
}
