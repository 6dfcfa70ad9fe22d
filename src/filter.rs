use regex::{Regex, RegexBuilder};

use crate::diag::{Error, Result};

/// What a filter expression is matched against.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Absolute module paths.
    Module,
    /// Function signatures / symbol names.
    Symbol,
}

/// A compiled regular expression applied to module paths or symbol names.
#[derive(Debug)]
pub struct Filter {
    expr: Regex,
    mode: Mode,
}

impl Filter {
    /// Compile a filter expression.
    ///
    /// # Errors
    ///
    /// Returns an `Err` when the expression does not compile.
    pub fn new(expr: &str, icase: bool, mode: Mode) -> Result<Self> {
        let expr = RegexBuilder::new(expr)
            .case_insensitive(icase)
            .build()
            .map_err(|e| {
                Error::invalid_argument(format!(
                    "failed to compile filter '{expr}' ({e})"
                ))
            })?;

        Ok(Self { expr, mode })
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn expr(&self) -> &str {
        self.expr.as_str()
    }

    /// Apply the filter to a module path or a symbol name.
    #[must_use]
    pub fn apply(&self, target: &str) -> bool {
        self.expr.is_match(target)
    }
}
