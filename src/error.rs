use thiserror::Error;

use crate::signal::LogicalType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy for the modeling core.
///
/// Construction-time problems surface as [`Error::Property`] or
/// [`Error::Duplicate`] and are fatal to the interface or model being built.
/// Runtime violations of the interface contract surface as
/// [`Error::Protocol`] out of the event loop or a signal capture; the
/// transaction in progress is aborted and no retry is attempted.
#[derive(Debug, Error)]
pub enum Error {
    /// The interface contract was violated at runtime: an unresolvable
    /// sample, a control context the state machine cannot legally occupy,
    /// broken packet framing, or a missing required signal.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A construction-time parameter was out of range or inconsistent.
    #[error("invalid property: {0}")]
    Property(String),

    /// A drive was attempted with a value of the wrong logical type.
    #[error("signal `{signal}` expects {expected} values")]
    Type {
        signal: String,
        expected: LogicalType,
    },

    /// Two signals with the same name were specified for one interface.
    #[error("duplicate signal `{0}`")]
    Duplicate(String),

    /// The caller handed the model something it cannot use, e.g. a
    /// transaction whose signal set does not match the model's role.
    #[error("{0}")]
    Value(String),

    /// The signal was never bound to a simulator wire.
    #[error("signal `{0}` is not bound to a wire")]
    NotInstantiated(String),
}
