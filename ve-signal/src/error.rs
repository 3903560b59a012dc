#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such VE task")]
    NoSuchTask,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("fault")]
    Fault,
    #[error("dma engine error: {0}")]
    Dma(#[from] ve_dma::Error),
    #[error("memory facade error: {0}")]
    Mem(#[from] ve_mem::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::InvalidArgument => libc::EINVAL,
            Error::NoSuchTask => libc::ESRCH,
            Error::NotPermitted => libc::EPERM,
            Error::Fault => libc::EFAULT,
            Error::Dma(e) => e.to_errno(),
            Error::Mem(e) => e.to_errno(),
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Nix(e) => *e as i32,
        }
    }
}
