//! Error taxonomy for the core: evaluator, optimizer, and bytecode generator
//! all surface one of these kinds, uniformly, up their call chains.

use std::fmt;

use strum_macros::{Display as StrumDisplay, EnumString, IntoStaticStr};

use crate::value::Value;

/// The scope a lookup failed in, carried by `CsError::Undefined` so callers
/// can render "undefined in current scope" vs "undefined in global scope".
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString, IntoStaticStr)]
pub enum LookupScope {
    Current,
    Global,
    Any,
}

/// A core error, independent of file/line context. Statement execution wraps
/// these into [`RuntimeError`] exactly once on the way out of a statement.
#[derive(Debug, Clone)]
pub enum CsError {
    /// Malformed grammar discovered during optimization.
    Syntax(String),
    /// An invariant the AST or IR builder assumed was violated.
    Grammar(String),
    /// An operator or operation was applied to operand types it does not support.
    Unsupported(String),
    /// A name was looked up but not bound in the scope(s) searched.
    Undefined { name: String, scope: LookupScope },
    /// A name was declared twice in the same record set.
    Redefinition(String),
    /// A name was bound twice in the same domain.
    AlreadyBound(String),
    /// A callable was invoked with the wrong number of arguments.
    ArgumentCountMismatch { expected: usize, got: usize },
    /// A user `throw` of a `lang_error` value, propagating until a `try` catches it.
    LangError(Value),
    /// Unrecoverable condition (missing input, uncaught language error at top level).
    Fatal(String),
    /// A generic failure already wrapped with file/line/raw-source by the
    /// statement runner that first caught it - already-wrapped runtime
    /// exceptions re-propagate unchanged on the way further out. Enclosing
    /// statements see this variant and pass it through unchanged instead of
    /// wrapping it a second time.
    Wrapped(Box<RuntimeError>),
}

impl CsError {
    pub fn undefined(name: impl Into<String>, scope: LookupScope) -> Self {
        Self::Undefined { name: name.into(), scope }
    }

    pub fn redefinition(name: impl Into<String>) -> Self {
        Self::Redefinition(name.into())
    }

    pub fn already_bound(name: impl Into<String>) -> Self {
        Self::AlreadyBound(name.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }

    pub fn grammar(msg: impl Into<String>) -> Self {
        Self::Grammar(msg.into())
    }

    pub fn arg_count(expected: usize, got: usize) -> Self {
        Self::ArgumentCountMismatch { expected, got }
    }

    /// True for the one throwable value kind; anything else is a syntax error.
    pub fn throw(value: Value) -> Self {
        if value.is_lang_error() {
            Self::LangError(value)
        } else {
            Self::Syntax("only language-error values may be thrown".to_string())
        }
    }

    /// Wraps `self` with diagnostic context, unless it already carries some
    /// (already-wrapped) or is a language error (propagates bare until a
    /// `try` catches it).
    pub fn wrap_with_context(self, file: impl Into<String>, line: u32, raw_source: impl Into<String>) -> Self {
        match self {
            Self::LangError(_) | Self::Wrapped(_) => self,
            other => Self::Wrapped(Box::new(RuntimeError::new(other).with_context(file, line, raw_source))),
        }
    }

    /// The language-error value carried by this error, if any - either a
    /// bare `LangError` or one wrapped inside a `Wrapped(RuntimeError)`.
    pub fn as_lang_error(&self) -> Option<&Value> {
        match self {
            Self::LangError(v) => Some(v),
            Self::Wrapped(e) => e.as_lang_error(),
            _ => None,
        }
    }
}

impl fmt::Display for CsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax(msg) => write!(f, "syntax error: {msg}"),
            Self::Grammar(msg) => write!(f, "grammar error: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported operation: {msg}"),
            Self::Undefined { name, scope } => write!(f, "undefined identifier `{name}` ({scope})"),
            Self::Redefinition(name) => write!(f, "redefinition of `{name}`"),
            Self::AlreadyBound(name) => write!(f, "`{name}` is already bound in this domain"),
            Self::ArgumentCountMismatch { expected, got } => {
                write!(f, "expected {expected} argument(s), got {got}")
            }
            Self::LangError(v) => write!(f, "uncaught exception: {}", v.display_lossy()),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
            Self::Wrapped(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CsError {}

/// A `CsError` wrapped with the diagnostic context a statement runner attaches
/// exactly once on the way out.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: CsError,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub raw_source: Option<String>,
}

impl RuntimeError {
    pub fn new(kind: CsError) -> Self {
        Self { kind, file: None, line: None, raw_source: None }
    }

    #[must_use]
    pub fn with_context(mut self, file: impl Into<String>, line: u32, raw_source: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self.raw_source = Some(raw_source.into());
        self
    }

    /// Whether this carries a throwable language-error value (propagates
    /// through `try`/`catch` rather than being a host-level failure).
    pub fn as_lang_error(&self) -> Option<&Value> {
        match &self.kind {
            CsError::LangError(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{file}:{line}: {}", self.kind),
            _ => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<CsError> for RuntimeError {
    fn from(kind: CsError) -> Self {
        Self::new(kind)
    }
}

pub type CsResult<T> = Result<T, CsError>;
pub type RunResult<T> = Result<T, RuntimeError>;
