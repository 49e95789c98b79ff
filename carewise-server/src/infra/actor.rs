use axum::{extract::FromRequestParts, http::request::Parts};

use carewise_core::analysis::Actor;

use super::errors::AppError;

pub const ACTOR_HEADER: &str = "x-actor-id";
const MAX_ACTOR_LEN: usize = 128;

/// Caller identity taken from the `x-actor-id` header.
///
/// Authentication happens upstream; a missing or blank header is treated as
/// `anonymous`.
#[derive(Debug, Clone)]
pub struct RequestActor(pub Actor);

impl<S> FromRequestParts<S> for RequestActor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(ACTOR_HEADER) else {
            return Ok(Self(Actor::anonymous()));
        };
        let raw = value
            .to_str()
            .map_err(|_| AppError::bad_request("x-actor-id must be visible ASCII"))?
            .trim();
        if raw.is_empty() {
            return Ok(Self(Actor::anonymous()));
        }
        if raw.len() > MAX_ACTOR_LEN {
            return Err(AppError::bad_request(format!(
                "x-actor-id exceeds {MAX_ACTOR_LEN} characters"
            )));
        }
        Ok(Self(Actor::new(raw)))
    }
}
