/// HTTP adapter around the dispatcher
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::core::session::{TransportContext, SESSION_COOKIE};
use crate::dispatch::{Operation, Reply, SessionChange};
use crate::error::GatewayError;
use crate::siridb::qpack;
use crate::transport::{socket, AppState};

const QPACK_CONTENT_TYPE: &str = "application/x-qpack";
const MSGPACK_CONTENT_TYPE: &str = "application/x-msgpack";

/// Encoding of a request body, mirrored in the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Json,
    Qpack,
    Msgpack,
}

impl BodyFormat {
    /// Format from the `Content-Type` header; JSON when the header is absent
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, GatewayError> {
        let Some(value) = headers.get(CONTENT_TYPE) else {
            return Ok(BodyFormat::Json);
        };
        let content_type = value
            .to_str()
            .unwrap_or_default()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match content_type.as_str() {
            "application/json" => Ok(BodyFormat::Json),
            QPACK_CONTENT_TYPE => Ok(BodyFormat::Qpack),
            MSGPACK_CONTENT_TYPE => Ok(BodyFormat::Msgpack),
            other => Err(GatewayError::UnsupportedMediaType(format!(
                "unsupported content type '{other}', expecting application/json, \
                 {QPACK_CONTENT_TYPE} or {MSGPACK_CONTENT_TYPE}"
            ))),
        }
    }

    pub fn decode(self, body: &[u8]) -> Result<Value, GatewayError> {
        match self {
            BodyFormat::Json => serde_json::from_slice(body)
                .map_err(|e| GatewayError::bad_request(format!("invalid JSON body: {e}"))),
            BodyFormat::Qpack => qpack::unpack(body)
                .map_err(|e| GatewayError::bad_request(format!("invalid qpack body: {e}"))),
            BodyFormat::Msgpack => rmp_serde::from_slice(body)
                .map_err(|e| GatewayError::bad_request(format!("invalid msgpack body: {e}"))),
        }
    }
}

/// Build the router; `/socket` is only served when `enable_socket` is set
pub fn router(state: AppState, enable_socket: bool) -> Router {
    let mut router = Router::new()
        .route("/db-info", get(db_info))
        .route("/auth/fetch", get(auth_fetch))
        .route("/auth/login", post(auth_login))
        .route("/auth/logout", get(auth_logout).post(auth_logout))
        .route("/query", post(query))
        .route("/insert", post(insert));

    if enable_socket {
        router = router.route("/socket", get(socket::ws_handler));
    }

    router
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Session id and shared secret carried by the request headers
pub fn transport_context(headers: &HeaderMap) -> TransportContext {
    let session_id = CookieJar::from_headers(headers)
        .get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty());

    let secret = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_secret);

    TransportContext::Http { session_id, secret }
}

/// Value of `Secret <value>`; the scheme is case-insensitive
fn parse_secret(authorization: &str) -> Option<String> {
    let (scheme, secret) = authorization.trim().split_once(char::is_whitespace)?;
    let secret = secret.trim_start();
    if !scheme.eq_ignore_ascii_case("secret")
        || secret.is_empty()
        || secret.contains(char::is_whitespace)
    {
        return None;
    }
    Some(secret.to_string())
}

async fn db_info(State(state): State<AppState>, headers: HeaderMap) -> Response {
    respond(&state, &headers, Operation::DbInfo).await
}

async fn auth_fetch(State(state): State<AppState>, headers: HeaderMap) -> Response {
    respond(&state, &headers, Operation::AuthFetch).await
}

async fn auth_logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    respond(&state, &headers, Operation::AuthLogout).await
}

async fn auth_login(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    respond_with_body(&state, &headers, &body, "auth login").await
}

async fn query(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    respond_with_body(&state, &headers, &body, "query").await
}

async fn insert(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    respond_with_body(&state, &headers, &body, "insert").await
}

async fn not_found() -> Response {
    let err = GatewayError::NotFound("no such resource".to_string());
    render(Reply::error(&err), BodyFormat::Json, 0)
}

async fn respond(state: &AppState, headers: &HeaderMap, op: Operation) -> Response {
    let ctx = transport_context(headers);
    let reply = state.dispatcher.dispatch(&ctx, op).await;
    render(reply, BodyFormat::Json, state.cookie_max_age)
}

async fn respond_with_body(state: &AppState, headers: &HeaderMap, body: &[u8], event: &str) -> Response {
    let format = match BodyFormat::from_headers(headers) {
        Ok(format) => format,
        Err(e) => return render(Reply::error(&e), BodyFormat::Json, state.cookie_max_age),
    };

    let ctx = transport_context(headers);
    let reply = match format
        .decode(body)
        .and_then(|data| Operation::from_event(event, data))
    {
        Ok(op) => state.dispatcher.dispatch(&ctx, op).await,
        Err(e) => Reply::error(&e),
    };
    render(reply, format, state.cookie_max_age)
}

fn render(reply: Reply, format: BodyFormat, cookie_max_age: u64) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let jar = match reply.session {
        SessionChange::Unchanged => CookieJar::new(),
        SessionChange::Set(id) => CookieJar::new().add(session_cookie(id, cookie_max_age)),
        SessionChange::Clear => CookieJar::new().add(session_cookie(String::new(), 0)),
    };

    match format {
        BodyFormat::Json => (status, jar, Json(reply.payload)).into_response(),
        BodyFormat::Qpack => (
            status,
            jar,
            [(CONTENT_TYPE, QPACK_CONTENT_TYPE)],
            qpack::pack(&reply.payload).freeze(),
        )
            .into_response(),
        BodyFormat::Msgpack => match rmp_serde::to_vec_named(&reply.payload) {
            Ok(body) => (status, jar, [(CONTENT_TYPE, MSGPACK_CONTENT_TYPE)], body).into_response(),
            Err(e) => {
                let err = GatewayError::internal(format!("cannot encode msgpack reply: {e}"));
                (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_payload())).into_response()
            }
        },
    }
}

fn session_cookie(value: String, max_age: u64) -> Cookie<'static> {
    let max_age = i64::try_from(max_age).unwrap_or(i64::MAX);
    Cookie::build((SESSION_COOKIE, value))
        .path("/")
        .http_only(true)
        .max_age(time::Duration::seconds(max_age))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::AuthSettings;
    use crate::dispatch::tests::{harness, open};
    use axum::body::Body;
    use axum::http::header::{COOKIE, SET_COOKIE};
    use axum::http::{HeaderValue, Request};
    use serde_json::json;
    use tower::ServiceExt;

    async fn app(settings: AuthSettings) -> Router {
        let h = harness(settings).await;
        router(AppState::new(h.dispatcher, 3600), false)
    }

    fn required() -> AuthSettings {
        AuthSettings {
            require_auth: true,
            multi_user: false,
            secret: Some("my_super_secret".to_string()),
        }
    }

    async fn body_json(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_db_info_with_cors() {
        let app = app(open()).await;
        let req = Request::builder()
            .uri("/db-info")
            .header("origin", "http://example.com")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");

        let body = body_json(resp).await;
        assert_eq!(body["dbname"], "dbtest");
        assert_eq!(body["time_precision"], "ms");
        assert!(body["http_server"].is_string());
    }

    #[tokio::test]
    async fn test_login_sets_cookie_and_logout_clears_it() {
        let app = app(required()).await;

        let resp = app
            .clone()
            .oneshot(post_json("/auth/login", json!({"username": "iris", "password": "siri"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let set_cookie = resp.headers()[SET_COOKIE].to_str().unwrap().to_string();
        assert!(set_cookie.starts_with("siridbadminsessionid="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Max-Age=3600"));
        assert_eq!(body_json(resp).await, json!({"user": "iris"}));

        let cookie = set_cookie.split(';').next().unwrap().to_string();
        let fetch = Request::builder()
            .uri("/auth/fetch")
            .header(COOKIE, cookie.as_str())
            .body(Body::empty())
            .unwrap();
        let body = body_json(app.clone().oneshot(fetch).await.unwrap()).await;
        assert_eq!(body["authenticated"], true);
        assert_eq!(body["auth_required"], true);

        let logout = Request::builder()
            .uri("/auth/logout")
            .header(COOKIE, cookie.as_str())
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(logout).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[SET_COOKIE].to_str().unwrap().contains("Max-Age=0"));

        let fetch = Request::builder()
            .uri("/auth/fetch")
            .header(COOKIE, cookie.as_str())
            .body(Body::empty())
            .unwrap();
        let body = body_json(app.oneshot(fetch).await.unwrap()).await;
        assert_eq!(body["authenticated"], false);
    }

    #[tokio::test]
    async fn test_query_requires_authentication() {
        let app = app(required()).await;
        let resp = app
            .oneshot(post_json("/query", json!({"query": "list series"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "auth_error");
    }

    #[tokio::test]
    async fn test_secret_header_authenticates() {
        let app = app(required()).await;
        let mut req = post_json("/query", json!({"query": "list series"}));
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Secret my_super_secret"));

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"query": "list series"}));
    }

    #[tokio::test]
    async fn test_qpack_request_gets_qpack_reply() {
        let app = app(open()).await;
        let body = qpack::pack(&json!({"query": "list series"})).freeze();
        let req = Request::builder()
            .method("POST")
            .uri("/query")
            .header(CONTENT_TYPE, QPACK_CONTENT_TYPE)
            .body(Body::from(body))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], QPACK_CONTENT_TYPE);

        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        assert_eq!(qpack::unpack(&bytes).unwrap(), json!({"query": "list series"}));
    }

    #[tokio::test]
    async fn test_msgpack_request_gets_msgpack_reply() {
        let app = app(open()).await;
        let body = rmp_serde::to_vec_named(&json!({"query": "list series"})).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/query")
            .header(CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
            .body(Body::from(body))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], MSGPACK_CONTENT_TYPE);

        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        let reply: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(reply, json!({"query": "list series"}));
    }

    #[tokio::test]
    async fn test_malformed_msgpack_body() {
        let app = app(open()).await;
        let req = Request::builder()
            .method("POST")
            .uri("/insert")
            .header(CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
            .body(Body::from(vec![0xc1u8]))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_insert_json() {
        let app = app(open()).await;
        let resp = app
            .oneshot(post_json("/insert", json!({"cpu": [[1471254705, 0.5]]})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_json(resp).await["success_msg"].is_string());
    }

    #[tokio::test]
    async fn test_unsupported_content_type() {
        let app = app(open()).await;
        let req = Request::builder()
            .method("POST")
            .uri("/insert")
            .header(CONTENT_TYPE, "text/plain")
            .body(Body::from("cpu 1 2"))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body_json(resp).await["error"], "unsupported_media_type");
    }

    #[tokio::test]
    async fn test_malformed_json_body() {
        let app = app(open()).await;
        let req = Request::builder()
            .method("POST")
            .uri("/query")
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Body::from("{\"query\":"))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let app = app(open()).await;
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "not_found");
    }

    #[tokio::test]
    async fn test_socket_route_absent_when_disabled() {
        let app = app(open()).await;
        let req = Request::builder().uri("/socket").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_transport_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; siridbadminsessionid=abc123"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Secret s3cret"));

        match transport_context(&headers) {
            TransportContext::Http { session_id, secret } => {
                assert_eq!(session_id.as_deref(), Some("abc123"));
                assert_eq!(secret.as_deref(), Some("s3cret"));
            }
            other => panic!("unexpected context {other:?}"),
        }
    }

    #[test]
    fn test_secret_scheme_is_case_insensitive() {
        assert_eq!(parse_secret("secret s3cret").as_deref(), Some("s3cret"));
        assert_eq!(parse_secret("SECRET s3cret").as_deref(), Some("s3cret"));
        assert_eq!(parse_secret("Secret  s3cret ").as_deref(), Some("s3cret"));
        assert_eq!(parse_secret("Bearer s3cret"), None);
        assert_eq!(parse_secret("Secret"), None);
        assert_eq!(parse_secret("Secret two words"), None);
    }

    #[tokio::test]
    async fn test_lowercase_secret_header_authenticates() {
        let app = app(required()).await;
        let mut req = post_json("/query", json!({"query": "list series"}));
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("secret my_super_secret"));

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
