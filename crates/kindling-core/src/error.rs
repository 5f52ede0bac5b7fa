use std::sync::Arc;

/// An error that can occur in kindling.
///
/// Errors carry a kind, a message and an optional cause. Lookup misses are
/// not errors: APIs that may find nothing return `Ok(None)`.
#[derive(Clone)]
pub struct Error {
    inner: Arc<ErrorInner>,
}

#[derive(Debug)]
struct ErrorInner {
    kind: ErrorKind,
    message: String,
    cause: Option<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed adapter configuration, schema reset failure.
    Configuration,
    /// Invalid kind definition: duplicate column, multiple inheritance.
    SchemaConflict,
    /// Unknown field name in an aggregate or join, invalid converter.
    ColumnBind,
    /// Driver-returned error during exec/query.
    Sql,
    /// A statement that must return a row returned none.
    NoRow,
    /// A single-result query returned more than one row.
    MultipleRows,
    /// Bad id, un-populated update, key parse failure.
    InvalidIdentifier,
    /// A scanned or assigned kind does not derive from the expected kind.
    TypeMismatch,
}

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::SchemaConflict => "schema conflict",
            ErrorKind::ColumnBind => "column bind error",
            ErrorKind::Sql => "sql error",
            ErrorKind::NoRow => "no row",
            ErrorKind::MultipleRows => "multiple rows",
            ErrorKind::InvalidIdentifier => "invalid identifier",
            ErrorKind::TypeMismatch => "type mismatch",
        }
    }
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            inner: Arc::new(ErrorInner {
                kind,
                message: message.into(),
                cause: None,
            }),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Configuration, message)
    }

    pub fn schema_conflict(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::SchemaConflict, message)
    }

    pub fn column_bind(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::ColumnBind, message)
    }

    pub fn sql(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Sql, message)
    }

    pub fn no_row(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::NoRow, message)
    }

    pub fn multiple_rows(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::MultipleRows, message)
    }

    pub fn invalid_identifier(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::InvalidIdentifier, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::TypeMismatch, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    /// Wraps this error in a new one, keeping it as the cause.
    ///
    /// Context is displayed first, followed by the root cause.
    pub fn context(self, kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            inner: Arc::new(ErrorInner {
                kind,
                message: message.into(),
                cause: Some(self),
            }),
        }
    }

    fn chain(&self) -> impl Iterator<Item = &Error> {
        let mut err = self;
        core::iter::once(err).chain(core::iter::from_fn(move || {
            err = err.inner.cause.as_ref()?;
            Some(err)
        }))
    }
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut it = self.chain().peekable();
        while let Some(err) = it.next() {
            write!(f, "{}: {}", err.inner.kind.label(), err.inner.message)?;
            if it.peek().is_some() {
                f.write_str(": ")?;
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if !f.alternate() {
            core::fmt::Display::fmt(self, f)
        } else {
            f.debug_struct("Error")
                .field("kind", &self.inner.kind)
                .field("message", &self.inner.message)
                .field("cause", &self.inner.cause)
                .finish()
        }
    }
}
