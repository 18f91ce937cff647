use thiserror::Error;

use crate::identity::Identity;

/// Rejections raised before any collaborator is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Please enter an email address")]
    Empty,
    #[error("Please enter a valid email address")]
    Malformed,
    #[error("You cannot call yourself. Enter a different email.")]
    SelfCall,
}

/// Returned by `Client` commands whose preconditions do not hold.
///
/// Collaborator failures (media, signaling, negotiation) never show up here;
/// they are reported as `ClientEvent::Notice` after the matching transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("already logged in as {0}")]
    AlreadyLoggedIn(Identity),
    #[error("a call with {0} is already in progress")]
    CallInProgress(Identity),
    #[error("there is no incoming call")]
    NoIncomingCall,
    #[error("the client has shut down")]
    Shutdown,
}
