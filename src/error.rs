//! Error types surfaced by the service contracts.
//!
//! Stream-internal failures never become `Result`s: a broken stream closes
//! itself and its peer, and the closure *is* the error signal. Only the
//! pluggable collaborators (service broker, transport acquisition) report
//! errors as values, because the smart socket must turn them into `FAIL`
//! lines on the client fd.

use std::io;

/// Error opening a service or acquiring a transport.
#[derive(Debug)]
pub enum ServiceError {
    /// No service registered under the requested name.
    NotFound,
    /// The service exists but could not be started.
    Io(io::Error),
    /// No transport matches the request.
    TransportUnavailable(String),
    /// A transport matched but its connection is down.
    Offline(String),
}

impl ServiceError {
    /// The reason text to put in the `FAIL` line sent to the client.
    pub fn fail_reason(&self) -> String {
        match self {
            ServiceError::NotFound => "unknown host service".to_string(),
            ServiceError::Io(e) => e.to_string(),
            ServiceError::TransportUnavailable(reason) => reason.clone(),
            ServiceError::Offline(reason) => format!("device offline ({reason})"),
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::NotFound => write!(f, "unknown host service"),
            ServiceError::Io(e) => write!(f, "service failed to start: {e}"),
            ServiceError::TransportUnavailable(reason) => {
                write!(f, "transport unavailable: {reason}")
            }
            ServiceError::Offline(reason) => write!(f, "device offline: {reason}"),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServiceError {
    fn from(e: io::Error) -> Self {
        ServiceError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_reasons_match_protocol_text() {
        assert_eq!(ServiceError::NotFound.fail_reason(), "unknown host service");
        assert_eq!(
            ServiceError::Offline("transport offline".into()).fail_reason(),
            "device offline (transport offline)"
        );
        assert_eq!(
            ServiceError::TransportUnavailable("no devices".into()).fail_reason(),
            "no devices"
        );
    }
}
