use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fmt, result,
};

/// Failure classification, by kind rather than by source type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    /// An empty or otherwise unusable value where one is required.
    InvalidArgument,
    /// Indexed access past the current size.
    OutOfBounds,
    /// The object-file parser or the dynamic loader reported a failure.
    Backend,
    /// A module has no usable symbol table.
    Stripped,
    /// Duplicate thread or plugin identity.
    AlreadyRegistered,
    /// A plugin entry point could not be resolved in its module.
    SymbolMissing,
    /// A system call failed.
    System,
    /// An internal invariant was violated.
    Logic,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nm = match self {
            Self::InvalidArgument => "invalid argument",
            Self::OutOfBounds => "out of bounds",
            Self::Backend => "backend error",
            Self::Stripped => "stripped",
            Self::AlreadyRegistered => "already registered",
            Self::SymbolMissing => "symbol missing",
            Self::System => "system error",
            Self::Logic => "logic error",
        };

        write!(f, "{nm}")
    }
}

pub struct Error {
    kind: Kind,
    error: String,
    backtrace: Backtrace,
}

impl Error {
    fn new(kind: Kind, error: String) -> Self {
        Self {
            kind,
            error,
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.error
    }

    pub fn invalid_argument(what: impl fmt::Display) -> Self {
        Self::new(Kind::InvalidArgument, what.to_string())
    }

    pub fn out_of_bounds(index: usize, size: usize) -> Self {
        Self::new(Kind::OutOfBounds, format!("offset {index} >= {size}"))
    }

    pub fn backend(what: impl fmt::Display) -> Self {
        Self::new(Kind::Backend, what.to_string())
    }

    pub fn stripped(path: &str) -> Self {
        Self::new(Kind::Stripped, format!("'{path}' has no symbol table"))
    }

    pub fn already_registered(what: impl fmt::Display) -> Self {
        Self::new(Kind::AlreadyRegistered, what.to_string())
    }

    pub fn symbol_missing(symbol: &str, path: &str) -> Self {
        Self::new(
            Kind::SymbolMissing,
            format!("failed to resolve symbol {symbol} in object '{path}'"),
        )
    }

    pub fn logic(what: impl fmt::Display) -> Self {
        Self::new(Kind::Logic, what.to_string())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)?;
        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nBacktrace:\n{}", self.backtrace)
        } else {
            Ok(())
        }
    }
}

impl<E: fmt::Display> From<E> for Error {
    fn from(e: E) -> Error {
        Error::new(Kind::System, e.to_string())
    }
}

pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    use ctor::ctor;
    use nix::errno::Errno;

    #[ctor]
    fn init() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }

    #[test]
    fn test_error_kind_and_message() {
        let error = Error::stripped("/lib/libfoo.so");
        assert_eq!(error.kind(), Kind::Stripped);
        assert!(error.message().contains("/lib/libfoo.so"));
    }

    #[test]
    fn test_error_from_errno() {
        let error: Error = Errno::ENODATA.into();
        assert_eq!(error.kind(), Kind::System);
        assert!(error.backtrace.status() == BacktraceStatus::Captured);
    }

    #[test]
    fn test_error_debug() {
        let error = Error::out_of_bounds(7, 3);
        let debug_output = format!("{:?}", error);
        assert!(debug_output.contains("out of bounds"));
        assert!(debug_output.contains("7 >= 3"));
        assert!(debug_output.contains("Backtrace"));
    }

    #[test]
    fn test_result_err() {
        let result: Result<u32> = Err(Error::invalid_argument("empty path"));
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), Kind::InvalidArgument);
    }
}
