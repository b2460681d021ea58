//! Tenant context extracted from gateway headers.
//!
//! The gateway authenticates the caller and forwards the organization and
//! actor as headers. Every settlement operation is scoped to `org_id`.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const ORG_ID_HEADER: &str = "X-Org-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";
pub const USER_EMAIL_HEADER: &str = "X-User-Email";

const UNKNOWN_ACTOR: &str = "unknown";

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub org_id: String,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
}

impl TenantContext {
    pub fn new(org_id: String, user_id: Option<String>, user_email: Option<String>) -> Self {
        Self {
            org_id,
            user_id,
            user_email,
        }
    }

    /// Identity recorded on run transitions: email, then user id.
    pub fn actor(&self) -> &str {
        self.user_email
            .as_deref()
            .or(self.user_id.as_deref())
            .unwrap_or(UNKNOWN_ACTOR)
    }
}

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let org_id = header(parts, ORG_ID_HEADER).ok_or_else(|| {
            AppError::AuthError(anyhow::anyhow!("Missing X-Org-ID header (required from gateway)"))
        })?;
        let user_id = header(parts, USER_ID_HEADER);
        let user_email = header(parts, USER_EMAIL_HEADER);

        let span = tracing::Span::current();
        span.record("org_id", org_id.as_str());
        if let Some(ref uid) = user_id {
            span.record("user_id", uid.as_str());
        }

        Ok(TenantContext::new(org_id, user_id, user_email))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(builder: axum::http::request::Builder) -> Result<TenantContext, AppError> {
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        TenantContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_missing_org_is_rejected() {
        let err = extract(Request::builder().uri("/settlements"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AuthError(_)));
    }

    #[tokio::test]
    async fn test_actor_prefers_email() {
        let ctx = extract(
            Request::builder()
                .header(ORG_ID_HEADER, "org-1")
                .header(USER_ID_HEADER, "u-7")
                .header(USER_EMAIL_HEADER, "ops@example.com"),
        )
        .await
        .unwrap();
        assert_eq!(ctx.org_id, "org-1");
        assert_eq!(ctx.actor(), "ops@example.com");

        let ctx = extract(Request::builder().header(ORG_ID_HEADER, "org-1"))
            .await
            .unwrap();
        assert_eq!(ctx.actor(), "unknown");
    }
}
