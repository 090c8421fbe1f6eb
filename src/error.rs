use crate::deps::thiserror;



#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("an io error occurred: {source}")]
    IO {
        #[from]
        source: std::io::Error,
        #[cfg(feature = "nightly")]
        backtrace: std::backtrace::Backtrace,
    },

    #[error("an error occurred casting between integer types: {source}")]
    Number{
        #[from] source: std::num::TryFromIntError,
        #[cfg(feature = "nightly")]
        backtrace: std::backtrace::Backtrace,
    },

    #[error("parsing {typename} from {value:?}, reason: {reason:}")]
    Parse {
        value:    String,
        typename: &'static str,
        reason:   String,
    },

    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("pid {pid} is gone")]
    PidGone { pid: usize },

    #[error("syscall {name} failed: {reason}")]
    Syscall { name: &'static str, reason: String },

    #[error("kernel interface unsupported: {reason}")]
    KernelUnsupported { reason: String },

    #[error("{what} is already started")]
    AlreadyStarted { what: &'static str },

    #[error("unknown error")]
    Unknown,
}

impl Error {
    pub fn config<S: Into<String>>(reason: S) -> Self {
        Error::Config { reason: reason.into() }
    }

    pub fn syscall(name: &'static str, reason: impl std::fmt::Display) -> Self {
        Error::Syscall { name, reason: reason.to_string() }
    }

    pub fn kernel_unsupported<S: Into<String>>(reason: S) -> Self {
        Error::KernelUnsupported { reason: reason.into() }
    }

    /// non-fatal per-pid errors (§1 Non-goals, §7): file vanished, permission
    /// denied, or otherwise unreadable. Callers drop the pid and continue.
    pub fn is_pid_fatal(&self) -> bool {
        match self {
            Error::IO { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            Error::PidGone { .. } => false,
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
