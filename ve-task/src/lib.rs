pub mod error;
pub mod polling;
pub mod registers;
pub mod registry;
pub mod signals;
pub mod stopping;
pub mod task;

pub use error::Error;
pub use polling::{DeadPidSource, NullDeadPidSource, PollingThread, RealDeadPidSource};
pub use registers::RegisterImage;
pub use registry::{apply_group_action, mask_signal_in_group, GroupAction, ProcStatusSource, RealProcStatusSource, Registry};
pub use signals::{
    default_action, is_stop_class, is_synchronous, AltStack, DefaultAction, GroupFlag, Handler,
    PerTaskSignalState, QueuedSignal, SaFlags, SigAction, SigHand, SigHandGuarded, SigInfo,
    SEND_SIG_PRIV,
};
pub use stopping::StoppingThread;
pub use task::{BlockStatus, TaskInner, TaskState, VeTask};
