//! Admin impersonation: lets an admin caller act as another user for
//! support/debugging, by rewriting the request-scoped [`Claims`] before
//! the handler sees them. Runs after [`super::paseto::PasetoAuth::middleware`]
//! so `Claims` are already present in request extensions.

use axum::{body::Body, extract::Request, middleware::Next, response::Response};

use super::token::Claims;
use crate::error::Error;

const IMPERSONATE_HEADER: &str = "x-impersonate-user";

/// Rewrite the request's `Claims.sub` to the header's target user when
/// the caller is an admin. Non-admin callers carrying the header are
/// rejected outright rather than having it silently ignored, so a
/// misconfigured client fails loudly instead of quietly not impersonating.
pub async fn middleware(mut request: Request<Body>, next: Next) -> Result<Response, Error> {
    let Some(target) = request
        .headers()
        .get(IMPERSONATE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return Ok(next.run(request).await);
    };

    let claims = request
        .extensions()
        .get::<Claims>()
        .cloned()
        .ok_or_else(|| Error::Unauthorized("impersonation requires an authenticated caller".to_string()))?;

    if !claims.has_role("admin") {
        return Err(Error::Forbidden(
            "impersonation requires the admin role".to_string(),
        ));
    }

    tracing::info!(
        admin_sub = %claims.sub,
        target = %target,
        "admin impersonation active"
    );

    let mut impersonated = claims;
    impersonated.sub = format!("user:{}", target);
    request.extensions_mut().insert(impersonated);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin_claims() -> Claims {
        Claims {
            sub: "user:admin-1".to_string(),
            email: None,
            username: None,
            roles: vec!["admin".to_string()],
            perms: vec![],
            exp: 0,
            iat: None,
            jti: None,
            iss: None,
            aud: None,
        }
    }

    #[test]
    fn non_admin_claims_lack_the_admin_role() {
        let claims = Claims {
            sub: "user:regular".to_string(),
            email: None,
            username: None,
            roles: vec!["user".to_string()],
            perms: vec![],
            exp: 0,
            iat: None,
            jti: None,
            iss: None,
            aud: None,
        };
        assert!(!claims.has_role("admin"));
    }

    #[test]
    fn admin_claims_carry_the_admin_role() {
        assert!(admin_claims().has_role("admin"));
    }
}
