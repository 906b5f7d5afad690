use thiserror::Error;

/// Reasons the relay refuses a request. None of these are reported back to
/// the client; the connection task logs them and carries on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Join is missing a username")]
    MissingName,

    #[error("Join is missing a room id")]
    MissingRoom,
}
