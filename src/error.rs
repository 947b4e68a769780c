//! Custom error types for parsing and fetching Tor directory documents

use std::net::AddrParseError;
use std::num::ParseIntError;
use std::string::ToString;

use thiserror;

use crate::schedule::Target;

/// Error that occured when parsing a Tor document
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentParseError {
    #[error("Malformed '{keyword}' line (line {line}): {reason}")]
    MalformedLine {
        keyword: String,
        line: usize,
        reason: String,
    },
    #[error("An item with keyword '{keyword}' is not recognized here (line {line})")]
    UnrecognizedKeyword { keyword: String, line: usize },
    #[error("Keyword '{keyword}' may only appear once (line {line})")]
    DuplicateKeyword { keyword: String, line: usize },
    #[error("Keyword '{keyword}' is not valid in the {phase} (line {line})")]
    OrderingViolation {
        keyword: String,
        phase: String,
        line: usize,
    },
    #[error("Required field '{field}' is missing")]
    MissingRequiredField { field: String },
    #[error("Invalid value in {context}")]
    InvalidValue { context: String },
    #[error("Expected '{expected}' (line {line})")]
    MissingBeginMarker { expected: String, line: usize },
    #[error("Block started by '{marker}' is never terminated")]
    UnterminatedBlock { marker: String },
    #[error("Document ended while parsing {context}")]
    UnexpectedEndOfDocument { context: String },
    #[error("Block contents between '{marker}' markers are not valid base64")]
    SignatureBlockError { marker: String },
    #[error("Unsupported document version '{found}'")]
    UnsupportedVersion { found: String },
}

impl DocumentParseError {
    /// Create a new InvalidValue error, easily
    pub fn invalid(context: impl Into<String>) -> DocumentParseError {
        DocumentParseError::InvalidValue {
            context: context.into(),
        }
    }

    /// Create a new MissingRequiredField error, easily
    pub fn missing(field: impl Into<String>) -> DocumentParseError {
        DocumentParseError::MissingRequiredField {
            field: field.into(),
        }
    }

    /// Map the error of a generated builder onto the parse taxonomy.
    pub(crate) fn from_builder(err: impl ToString) -> DocumentParseError {
        // derive_builder reports "`field` must be initialized"
        let text = err.to_string();
        let field = match text.split('`').nth(1) {
            Some(f) => f.to_string(),
            None => text
                .rsplit(": ")
                .next()
                .unwrap_or(text.as_str())
                .to_string(),
        }
        .replace('_', "-");
        DocumentParseError::MissingRequiredField { field }
    }
}

/// Error that occured while acquiring a document from a mirror.
///
/// Every variant counts as a failure for backoff purposes; callers that
/// care tell transport and parse problems apart via the variant.
#[derive(thiserror::Error, Debug, Clone)]
pub enum FetchError {
    #[error("Transport failure talking to {host}:{port}: {reason}")]
    TransportFailure {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("Request to {host}:{port} timed out")]
    Timeout { host: String, port: u16 },
    #[error("Fetched document did not parse")]
    Parse(#[from] DocumentParseError),
    #[error("Discarded a {what} that was never requested")]
    UnsolicitedDocument { what: String },
    #[error("Discarded a {what} that is not newer than what we have")]
    StaleDocument { what: String },
    #[error("Signature check rejected a {what}")]
    SignatureRejected { what: String },
    #[error("No mirror or authority available for {0}")]
    NoSource(Target),
}

impl FetchError {
    /// Return true if this failure came from parsing rather than transport.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, FetchError::Parse(_))
    }
}

/// Error reported by a persistence backend.
#[derive(thiserror::Error, Debug, Clone)]
#[error("Storage failure for {family}: {reason}")]
pub struct StoreError {
    pub family: String,
    pub reason: String,
}

/// Errors from coordinator operations that are not absorbed into backoff.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Could not access the document store")]
    Store(#[from] StoreError),
    #[error("No directory authorities are configured")]
    NoAuthorities,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

pub(crate) trait ErrorContext<T> {
    type IntoError;

    fn context(self, context: impl ToString) -> Result<T, Self::IntoError>;
}

impl<T> ErrorContext<T> for Result<T, ParseIntError> {
    type IntoError = DocumentParseError;

    fn context(self, context: impl ToString) -> Result<T, Self::IntoError> {
        self.map_err(|_| DocumentParseError::InvalidValue {
            context: context.to_string(),
        })
    }
}

impl<T> ErrorContext<T> for Result<T, AddrParseError> {
    type IntoError = DocumentParseError;

    fn context(self, context: impl ToString) -> Result<T, Self::IntoError> {
        self.map_err(|_| DocumentParseError::InvalidValue {
            context: context.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder_error_names_field() {
        let err = DocumentParseError::from_builder("`router_signature` must be initialized");
        assert_eq!(err, DocumentParseError::missing("router-signature"));
    }

    #[test]
    fn int_context() {
        let err = "x".parse::<u16>().context("OR port").unwrap_err();
        assert_eq!(err, DocumentParseError::invalid("OR port"));
    }

    #[test]
    fn parse_errors_are_distinguishable() {
        let parse = FetchError::from(DocumentParseError::invalid("w"));
        let transport = FetchError::Timeout {
            host: "198.51.100.7".into(),
            port: 80,
        };
        assert!(parse.is_parse_error());
        assert!(!transport.is_parse_error());
    }
}
