use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::DriverSession;

pub const DRIVER_HEADER: &str = "x-driver-id";

#[async_trait]
impl<S> FromRequestParts<S> for DriverSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(DRIVER_HEADER)
            .ok_or_else(|| AppError::BadRequest(format!("missing {DRIVER_HEADER} header")))?
            .to_str()
            .map_err(|_| AppError::BadRequest(format!("{DRIVER_HEADER} is not valid text")))?;

        let driver_id = Uuid::parse_str(raw.trim())
            .map_err(|err| AppError::BadRequest(format!("invalid {DRIVER_HEADER}: {err}")))?;

        Ok(DriverSession::new(driver_id))
    }
}
