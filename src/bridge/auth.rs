use axum::{extract::Request, http::Uri, middleware::Next, response::Response};
use subtle::ConstantTimeEq;

use super::error::BridgeError;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Extract a `?token=` value from the query string. Browsers cannot set
/// headers on a WebSocket upgrade, so this is how they authenticate.
fn extract_query_token(req: &Request) -> Option<&str> {
    req.uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

/// The request target with any `token` query value masked, for logs.
pub fn redacted_uri(uri: &Uri) -> String {
    let path = uri.path();
    let Some(query) = uri.query() else {
        return path.to_string();
    };
    let query: Vec<&str> = query
        .split('&')
        .map(|pair| {
            if pair.starts_with("token=") {
                "token=[redacted]"
            } else {
                pair
            }
        })
        .collect();
    format!("{path}?{}", query.join("&"))
}

fn is_ws_upgrade(req: &Request) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Require `expected_token`, from the Authorization header or the query.
pub async fn require_auth(
    expected_token: String,
    req: Request,
    next: Next,
) -> Result<Response, BridgeError> {
    let valid = extract_bearer(&req)
        .or_else(|| extract_query_token(&req))
        .map(|token| bool::from(token.as_bytes().ct_eq(expected_token.as_bytes())));
    match valid {
        Some(true) => Ok(next.run(req).await),
        Some(false) => {
            tracing::debug!(path = %req.uri().path(), "rejected invalid token");
            Err(BridgeError::AuthInvalid)
        }
        None => Err(BridgeError::AuthRequired),
    }
}

/// Reject cross-origin WebSocket upgrades when running without a token.
///
/// Requests without an Origin header come from non-browser clients and pass.
pub async fn check_ws_origin(
    allowed_origins: Vec<String>,
    req: Request,
    next: Next,
) -> Result<Response, BridgeError> {
    if !is_ws_upgrade(&req) {
        return Ok(next.run(req).await);
    }
    let origin = match req.headers().get("origin").and_then(|v| v.to_str().ok()) {
        None => return Ok(next.run(req).await),
        Some(o) => o.to_string(),
    };
    if allowed_origins.iter().any(|allowed| allowed == &origin) {
        return Ok(next.run(req).await);
    }
    tracing::warn!(%origin, "rejected cross-origin websocket upgrade");
    Err(BridgeError::OriginNotAllowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn auth_app(token: &str) -> Router {
        let token = token.to_string();
        Router::new()
            .route("/ws/terminal", get(ok_handler))
            .layer(axum::middleware::from_fn(move |req, next| {
                let t = token.clone();
                async move { require_auth(t, req, next).await }
            }))
    }

    fn origin_app(allowed: Vec<String>) -> Router {
        Router::new()
            .route("/ws/terminal", get(ok_handler))
            .layer(axum::middleware::from_fn(move |req, next| {
                let origins = allowed.clone();
                check_ws_origin(origins, req, next)
            }))
    }

    async fn status(app: Router, req: Request<Body>) -> StatusCode {
        app.oneshot(req).await.unwrap().status()
    }

    #[test]
    fn extract_bearer_with_header() {
        let req = Request::builder()
            .uri("/x")
            .header("authorization", "Bearer abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), Some("abc"));
    }

    #[test]
    fn extract_query_token_among_other_params() {
        let req = Request::builder()
            .uri("/x?a=1&token=abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_query_token(&req), Some("abc"));
    }

    #[test]
    fn redacted_uri_masks_only_the_token() {
        let uri: Uri = "/ws/monitor?a=1&token=s3cret&b=2".parse().unwrap();
        assert_eq!(redacted_uri(&uri), "/ws/monitor?a=1&token=[redacted]&b=2");
        let uri: Uri = "/health".parse().unwrap();
        assert_eq!(redacted_uri(&uri), "/health");
        let uri: Uri = "/x?tokens=keep".parse().unwrap();
        assert_eq!(redacted_uri(&uri), "/x?tokens=keep");
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let req = Request::builder().uri("/ws/terminal").body(Body::empty()).unwrap();
        assert_eq!(status(auth_app("secret"), req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_is_403() {
        let req = Request::builder()
            .uri("/ws/terminal")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(auth_app("secret"), req).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn header_and_query_tokens_are_accepted() {
        let req = Request::builder()
            .uri("/ws/terminal")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(auth_app("secret"), req).await, StatusCode::OK);

        let req = Request::builder()
            .uri("/ws/terminal?token=secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(auth_app("secret"), req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn foreign_origin_upgrade_is_rejected() {
        let app = origin_app(vec!["http://127.0.0.1:7681".to_string()]);
        let req = Request::builder()
            .uri("/ws/terminal")
            .header("upgrade", "websocket")
            .header("origin", "http://evil.example")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(app, req).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn allowed_or_absent_origin_passes() {
        let allowed = vec!["http://127.0.0.1:7681".to_string()];
        let req = Request::builder()
            .uri("/ws/terminal")
            .header("upgrade", "websocket")
            .header("origin", "http://127.0.0.1:7681")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(origin_app(allowed.clone()), req).await, StatusCode::OK);

        let req = Request::builder()
            .uri("/ws/terminal")
            .header("upgrade", "websocket")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(origin_app(allowed), req).await, StatusCode::OK);
    }
}
