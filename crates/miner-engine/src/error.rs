use std::net::SocketAddr;

use thiserror::Error;

/// A pool message that could not be understood. The message is dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line is not valid JSON.
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    /// The line is JSON but not an object.
    #[error("message is not a json object")]
    NotAnObject,

    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// A field has the wrong type or an out-of-range value.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The line is not valid UTF-8.
    #[error("message is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The line is longer than the inbound limit. Its bytes were skipped
    /// up to the next newline.
    #[error("line of {len} bytes exceeds the {max} byte limit")]
    LineTooLong {
        /// Bytes skipped, newline excluded.
        len: usize,
        /// Configured limit.
        max: usize,
    },
}

/// Failures of the pool session.
///
/// Everything except [`SessionError::LoginRejected`] is recovered by
/// reconnecting.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The pool host name did not resolve.
    #[error("resolving {host} failed: {reason}")]
    Resolve {
        /// Host name.
        host: String,
        /// Resolver detail.
        reason: String,
    },

    /// No TCP connection could be made to a resolved endpoint.
    #[error("connecting to {addr} failed: {source}")]
    Connect {
        /// Endpoint tried last.
        addr: SocketAddr,
        /// Socket error.
        source: std::io::Error,
    },

    /// TLS setup or handshake failed.
    #[error("tls: {0}")]
    Tls(String),

    /// Reading or writing the connection failed.
    #[error("connection i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The pool closed the connection.
    #[error("connection closed by pool")]
    Closed,

    /// The pool refused the API key.
    #[error("login rejected by pool (code {code})")]
    LoginRejected {
        /// Result code sent by the pool.
        code: i64,
    },
}

impl SessionError {
    /// Whether reconnecting cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::LoginRejected { .. })
    }
}
