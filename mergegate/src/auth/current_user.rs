use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::{instrument, trace};

use crate::{
    AppState,
    errors::{Error, Result},
    types::UserId,
};

/// The user a request is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: UserId,
}

/// Read the user id from the trusted identity header.
/// Returns:
/// - Ok(None): header absent
/// - Ok(Some(id)): header present with a usable value
/// - Err(error): header present but empty or not valid UTF-8
fn user_from_header(parts: &Parts, header_name: &str) -> Result<Option<UserId>> {
    let Some(value) = parts.headers.get(header_name) else {
        return Ok(None);
    };

    let id = value.to_str().map_err(|_| Error::Unauthenticated {
        message: Some(format!("Invalid {header_name} header")),
    })?;
    let id = id.trim();
    if id.is_empty() {
        return Err(Error::Unauthenticated {
            message: Some(format!("Empty {header_name} header")),
        });
    }

    Ok(Some(id.to_string()))
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let header_name = &state.config.auth.user_header;
        match user_from_header(parts, header_name)? {
            Some(id) => {
                trace!(user_id = %id, "Authenticated from identity header");
                Ok(CurrentUser { id })
            }
            None => Err(Error::Unauthenticated { message: None }),
        }
    }
}
