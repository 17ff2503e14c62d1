//! Error types for the transfer engine
//!
//! This module defines the error taxonomy shared by all transfer
//! components, plus the reason codes reported to the registry.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Comprehensive error type for transfer operations
#[derive(Debug, Clone)]
pub enum TransferError {
    /// Generic leg/swarm failure
    Broken {
        message: String,
        source: Option<String>,
    },

    /// A local file vanished or never existed
    FileNotFound {
        message: String,
        path: Option<String>,
    },

    /// File I/O failure
    Io {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// A configured digest algorithm is not available.
    /// Fatal: indicates a misconfigured runtime, never retried.
    DigestUnavailable {
        algorithm: String,
    },

    /// Catch-all failure
    General {
        message: String,
        source: Option<String>,
    },

    /// A newer request replaced an older one from the same peer
    Superseded {
        message: String,
    },

    /// The remote peer disconnected
    PeerDisconnected {
        peer: Option<String>,
    },
}

impl TransferError {
    /// Create a new Broken error
    pub fn broken(message: impl Into<String>) -> Self {
        TransferError::Broken {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new Broken error with source
    pub fn broken_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TransferError::Broken {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new FileNotFound error
    pub fn file_not_found(message: impl Into<String>) -> Self {
        TransferError::FileNotFound {
            message: message.into(),
            path: None,
        }
    }

    /// Create a new FileNotFound error with path
    pub fn file_not_found_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TransferError::FileNotFound {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create a new Io error
    pub fn io(message: impl Into<String>) -> Self {
        TransferError::Io {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new Io error with path and source
    pub fn io_full(
        message: impl Into<String>,
        path: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TransferError::Io {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new DigestUnavailable error
    pub fn digest_unavailable(algorithm: impl Into<String>) -> Self {
        TransferError::DigestUnavailable {
            algorithm: algorithm.into(),
        }
    }

    /// Create a new General error
    pub fn general(message: impl Into<String>) -> Self {
        TransferError::General {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new General error with source
    pub fn general_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TransferError::General {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new Superseded error
    pub fn superseded(message: impl Into<String>) -> Self {
        TransferError::Superseded {
            message: message.into(),
        }
    }

    /// Create a new PeerDisconnected error
    pub fn peer_disconnected(peer: impl Into<String>) -> Self {
        TransferError::PeerDisconnected {
            peer: Some(peer.into()),
        }
    }

    /// The reason code reported to the registry for this error
    pub fn problem(&self) -> TransferProblem {
        match self {
            TransferError::Broken { .. } => TransferProblem::BrokenTransfer,
            TransferError::FileNotFound { .. } => TransferProblem::FileNotFound,
            TransferError::Io { .. } => TransferProblem::IoFailure,
            TransferError::DigestUnavailable { .. } => TransferProblem::DigestUnavailable,
            TransferError::General { .. } => TransferProblem::GeneralFailure,
            TransferError::Superseded { .. } => TransferProblem::SupersededRequest,
            TransferError::PeerDisconnected { .. } => TransferProblem::PeerDisconnected,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Broken { message, source } => {
                if let Some(src) = source {
                    write!(f, "Broken transfer: {} (source: {})", message, src)
                } else {
                    write!(f, "Broken transfer: {}", message)
                }
            }
            TransferError::FileNotFound { message, path } => {
                if let Some(p) = path {
                    write!(f, "File not found: {} (path: {})", message, p)
                } else {
                    write!(f, "File not found: {}", message)
                }
            }
            TransferError::Io {
                message,
                path,
                source,
            } => match (path, source) {
                (Some(p), Some(s)) => {
                    write!(f, "I/O failure: {} (path: {}, source: {})", message, p, s)
                }
                (Some(p), None) => write!(f, "I/O failure: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "I/O failure: {} (source: {})", message, s),
                (None, None) => write!(f, "I/O failure: {}", message),
            },
            TransferError::DigestUnavailable { algorithm } => {
                write!(f, "Digest algorithm unavailable: {}", algorithm)
            }
            TransferError::General { message, source } => {
                if let Some(src) = source {
                    write!(f, "General failure: {} (source: {})", message, src)
                } else {
                    write!(f, "General failure: {}", message)
                }
            }
            TransferError::Superseded { message } => {
                write!(f, "Superseded request: {}", message)
            }
            TransferError::PeerDisconnected { peer } => {
                if let Some(p) = peer {
                    write!(f, "Peer disconnected: {}", p)
                } else {
                    write!(f, "Peer disconnected")
                }
            }
        }
    }
}

impl std::error::Error for TransferError {}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TransferError::file_not_found(err.to_string()),
            _ => TransferError::Io {
                message: err.to_string(),
                path: None,
                source: Some(err.kind().to_string()),
            },
        }
    }
}

/// Reason code attached to a broken transfer when reporting to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferProblem {
    /// Generic leg/swarm failure
    BrokenTransfer,
    /// A local file vanished or never existed
    FileNotFound,
    /// File I/O failure
    IoFailure,
    /// Digest algorithm missing from the runtime; fatal
    DigestUnavailable,
    /// Catch-all
    GeneralFailure,
    /// A newer request replaced an older one from the same peer
    SupersededRequest,
    /// The remote peer disconnected
    PeerDisconnected,
}

impl TransferProblem {
    /// Whether a download broken with this problem may be re-queued for a
    /// later retry. `DigestUnavailable` indicates a misconfigured runtime
    /// and is never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransferProblem::DigestUnavailable)
    }
}

impl fmt::Display for TransferProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferProblem::BrokenTransfer => "broken transfer",
            TransferProblem::FileNotFound => "file not found",
            TransferProblem::IoFailure => "I/O failure",
            TransferProblem::DigestUnavailable => "digest algorithm unavailable",
            TransferProblem::GeneralFailure => "general failure",
            TransferProblem::SupersededRequest => "superseded request",
            TransferProblem::PeerDisconnected => "peer disconnected",
        };
        write!(f, "{}", name)
    }
}
