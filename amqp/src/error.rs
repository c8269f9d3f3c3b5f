//! Mapping from lapin errors to [`BrokerError`].

use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use purchase_status_core::BrokerError;

/// Classify a lapin error.
///
/// - `PRECONDITION_FAILED`: a declaration conflicts with an existing entity
/// - `ACCESS_REFUSED`, `NOT_ALLOWED`: credentials or vhost permissions
/// - I/O errors: the transport failed and a reconnect may help
pub(crate) fn map_error(err: &lapin::Error) -> BrokerError {
    match err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::TopologyConflict(err.to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
            | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED) => {
                BrokerError::Authentication(err.to_string())
            }
            _ => BrokerError::Protocol(err.to_string()),
        },
        lapin::Error::IOError(_) => BrokerError::Connection(err.to_string()),
        _ => BrokerError::Protocol(err.to_string()),
    }
}

/// Classify an error from `Connection::connect`.
///
/// Anything that is not an explicit refusal is treated as a connection
/// problem, so the client keeps retrying with backoff.
pub(crate) fn map_connect_error(err: &lapin::Error) -> BrokerError {
    match map_error(err) {
        BrokerError::Protocol(message) => BrokerError::Connection(message),
        other => other,
    }
}
