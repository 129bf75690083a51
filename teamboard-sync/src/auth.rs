//! Access-control collaborator.
//!
//! Session identity and workspace membership are verified outside the
//! engine. The registry asks an [`Authorizer`] before a join touches any
//! room state and trusts the supplied profile afterwards.

use thiserror::Error;

use crate::protocol::JoinRequest;

/// Why a join was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("room is full")]
    RoomFull,
    #[error("room unavailable")]
    RoomUnavailable,
    #[error("invalid join request: {0}")]
    InvalidRequest(String),
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, request: &JoinRequest) -> Result<(), JoinError>;
}

/// Admits everyone. Used when authorization happens upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _request: &JoinRequest) -> Result<(), JoinError> {
        Ok(())
    }
}

impl<F> Authorizer for F
where
    F: Fn(&JoinRequest) -> Result<(), JoinError> + Send + Sync,
{
    fn authorize(&self, request: &JoinRequest) -> Result<(), JoinError> {
        self(request)
    }
}

/// Structural checks applied to every join regardless of the authorizer.
pub(crate) fn validate_request(request: &JoinRequest) -> Result<(), JoinError> {
    if request.room_id.trim().is_empty() {
        return Err(JoinError::InvalidRequest("empty room id".into()));
    }
    if request.user.user_id.trim().is_empty() {
        return Err(JoinError::InvalidRequest("empty user id".into()));
    }
    Ok(())
}
