//! HTTP front door for applications that push notifications.
//!
//! Three POST endpoints over the store and the broker: `/broadcast`,
//! `/notify` and `/register`. Request validation is done by hand rather
//! than through extractors so every rejection carries the documented
//! machine-readable error label.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::broker::BrokerSending;
use crate::store::{PendingStore, StoreError};

pub const JSON_MEDIA_TYPE: &str = "application/json";

/// An API failure: HTTP status, machine-readable label, human message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub label: &'static str,
    pub message: &'static str,
}

// machine readable error labels
const IO_ERROR: &str = "io-error";
const INVALID_REQUEST: &str = "invalid-request";
const UNKNOWN_CHANNEL: &str = "unknown-channel";
const UNKNOWN_TOKEN: &str = "unknown-token";
const UNAUTHORIZED: &str = "unauthorized";
const UNAVAILABLE: &str = "unavailable";
const INTERNAL: &str = "internal";

impl ApiError {
    const fn new(status: StatusCode, label: &'static str, message: &'static str) -> Self {
        Self {
            status,
            label,
            message,
        }
    }
}

pub const ERR_NO_CONTENT_LENGTH: ApiError = ApiError::new(
    StatusCode::LENGTH_REQUIRED,
    INVALID_REQUEST,
    "A Content-Length must be provided",
);
pub const ERR_BODY_EMPTY: ApiError =
    ApiError::new(StatusCode::BAD_REQUEST, INVALID_REQUEST, "Request body empty");
pub const ERR_BODY_TOO_LARGE: ApiError = ApiError::new(
    StatusCode::PAYLOAD_TOO_LARGE,
    INVALID_REQUEST,
    "Request body too large",
);
pub const ERR_WRONG_CONTENT_TYPE: ApiError = ApiError::new(
    StatusCode::UNSUPPORTED_MEDIA_TYPE,
    INVALID_REQUEST,
    "Wrong content type, should be application/json",
);
pub const ERR_WRONG_METHOD: ApiError = ApiError::new(
    StatusCode::METHOD_NOT_ALLOWED,
    INVALID_REQUEST,
    "Wrong request method, should be POST",
);
pub const ERR_MALFORMED_JSON: ApiError = ApiError::new(
    StatusCode::BAD_REQUEST,
    INVALID_REQUEST,
    "Malformed JSON Object",
);
pub const ERR_COULD_NOT_READ_BODY: ApiError = ApiError::new(
    StatusCode::BAD_REQUEST,
    IO_ERROR,
    "Could not read request body",
);
pub const ERR_MISSING_ID_FIELD: ApiError =
    ApiError::new(StatusCode::BAD_REQUEST, INVALID_REQUEST, "Missing id field");
pub const ERR_MISSING_DATA: ApiError =
    ApiError::new(StatusCode::BAD_REQUEST, INVALID_REQUEST, "Missing data field");
pub const ERR_INVALID_EXPIRATION: ApiError = ApiError::new(
    StatusCode::BAD_REQUEST,
    INVALID_REQUEST,
    "Invalid expiration date",
);
pub const ERR_PAST_EXPIRATION: ApiError = ApiError::new(
    StatusCode::BAD_REQUEST,
    INVALID_REQUEST,
    "Past expiration date",
);
pub const ERR_UNKNOWN_CHANNEL: ApiError =
    ApiError::new(StatusCode::BAD_REQUEST, UNKNOWN_CHANNEL, "Unknown channel");
pub const ERR_UNKNOWN_TOKEN: ApiError =
    ApiError::new(StatusCode::BAD_REQUEST, UNKNOWN_TOKEN, "Unknown token");
pub const ERR_UNKNOWN: ApiError = ApiError::new(
    StatusCode::INTERNAL_SERVER_ERROR,
    INTERNAL,
    "Unknown error",
);
pub const ERR_STORE_UNAVAILABLE: ApiError = ApiError::new(
    StatusCode::SERVICE_UNAVAILABLE,
    UNAVAILABLE,
    "Message store unavailable",
);
pub const ERR_COULD_NOT_STORE_NOTIFICATION: ApiError = ApiError::new(
    StatusCode::SERVICE_UNAVAILABLE,
    UNAVAILABLE,
    "Could not store notification",
);
pub const ERR_COULD_NOT_MAKE_TOKEN: ApiError = ApiError::new(
    StatusCode::SERVICE_UNAVAILABLE,
    UNAVAILABLE,
    "Could not make token",
);
pub const ERR_COULD_NOT_RESOLVE_TOKEN: ApiError = ApiError::new(
    StatusCode::SERVICE_UNAVAILABLE,
    UNAVAILABLE,
    "Could not resolve token",
);
pub const ERR_UNAUTHORIZED: ApiError =
    ApiError::new(StatusCode::UNAUTHORIZED, UNAUTHORIZED, "Unauthorized");

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"error": self.label, "message": self.message});
        (
            self.status,
            [(header::CONTENT_TYPE, JSON_MEDIA_TYPE)],
            body.to_string(),
        )
            .into_response()
    }
}

type MsgIdGen = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn PendingStore>,
    broker: Arc<dyn BrokerSending>,
    max_body_bytes: usize,
    msg_id_gen: MsgIdGen,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn PendingStore>,
        broker: Arc<dyn BrokerSending>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            store,
            broker,
            max_body_bytes,
            msg_id_gen: Arc::new(generate_msg_id),
        }
    }

    /// Overrides server-side message id generation (test seam for the
    /// unicast idempotence path).
    pub fn with_msg_id_gen(mut self, msg_id_gen: MsgIdGen) -> Self {
        self.msg_id_gen = msg_id_gen;
        self
    }
}

fn generate_msg_id() -> String {
    BASE64.encode(Uuid::new_v4().as_bytes())
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/broadcast", any(serve_broadcast))
        .route("/notify", any(serve_notify))
        .route("/register", any(serve_register))
        .with_state(state)
}

/// Binds and serves the API until the process exits.
pub async fn serve(state: ApiState, addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("http api listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

#[derive(Debug, Default, Deserialize)]
struct BroadcastRequest {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    expire_on: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct UnicastRequest {
    #[serde(default)]
    token: String,
    #[serde(default)]
    userid: String,
    #[serde(default)]
    deviceid: String,
    #[serde(default)]
    appid: String,
    #[serde(default)]
    expire_on: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    deviceid: String,
    #[serde(default)]
    appid: String,
}

async fn serve_broadcast(State(state): State<ApiState>, request: Request) -> Response {
    match parse_post::<BroadcastRequest>(&state, request).await {
        Ok(bcast) => match do_broadcast(&state, bcast) {
            Ok(res) => ok_response(res),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

async fn serve_notify(State(state): State<ApiState>, request: Request) -> Response {
    match parse_post::<UnicastRequest>(&state, request).await {
        Ok(ucast) => match do_unicast(&state, ucast) {
            Ok(res) => ok_response(res),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

async fn serve_register(State(state): State<ApiState>, request: Request) -> Response {
    match parse_post::<RegisterRequest>(&state, request).await {
        Ok(reg) => match do_register(&state, reg) {
            Ok(res) => ok_response(res),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

fn ok_response(mut res: Value) -> Response {
    if let Some(obj) = res.as_object_mut() {
        obj.insert("ok".to_string(), json!(true));
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, JSON_MEDIA_TYPE)],
        res.to_string(),
    )
        .into_response()
}

/// Checks that the request is a well-formed JSON POST and parses its body.
async fn parse_post<T: DeserializeOwned>(state: &ApiState, request: Request) -> Result<T, ApiError> {
    let body = read_body(state, request).await?;
    serde_json::from_slice(&body).map_err(|_| ERR_MALFORMED_JSON)
}

async fn read_body(state: &ApiState, request: Request) -> Result<Bytes, ApiError> {
    if request.method() != Method::POST {
        return Err(ERR_WRONG_METHOD);
    }

    let content_length = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        .ok_or(ERR_NO_CONTENT_LENGTH)?;
    if content_length == 0 {
        return Err(ERR_BODY_EMPTY);
    }
    if content_length > state.max_body_bytes {
        return Err(ERR_BODY_TOO_LARGE);
    }

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type != JSON_MEDIA_TYPE {
        return Err(ERR_WRONG_CONTENT_TYPE);
    }

    axum::body::to_bytes(request.into_body(), state.max_body_bytes)
        .await
        .map_err(|_| ERR_COULD_NOT_READ_BODY)
}

/// Validates the fields shared by broadcast and unicast requests and
/// returns the parsed expiry.
fn check_cast_common(data: &Option<Value>, expire_on: &str) -> Result<OffsetDateTime, ApiError> {
    if data.is_none() {
        return Err(ERR_MISSING_DATA);
    }
    let expire =
        OffsetDateTime::parse(expire_on, &Rfc3339).map_err(|_| ERR_INVALID_EXPIRATION)?;
    if expire < OffsetDateTime::now_utc() {
        return Err(ERR_PAST_EXPIRATION);
    }
    Ok(expire)
}

fn do_broadcast(state: &ApiState, bcast: BroadcastRequest) -> Result<Value, ApiError> {
    let expire = check_cast_common(&bcast.data, &bcast.expire_on)?;
    let chan = state
        .store
        .get_internal_channel_id(&bcast.channel)
        .map_err(|err| match err {
            StoreError::UnknownChannel => ERR_UNKNOWN_CHANNEL,
            StoreError::Unavailable(_) => ERR_STORE_UNAVAILABLE,
            _ => ERR_UNKNOWN,
        })?;

    let data = bcast.data.unwrap_or(Value::Null);
    if let Err(err) = state.store.append_to_channel(&chan, data, expire) {
        tracing::error!("could not store notification: {err}");
        return Err(ERR_COULD_NOT_STORE_NOTIFICATION);
    }

    state.broker.broadcast(&chan);
    Ok(json!({}))
}

fn check_unicast(ucast: &UnicastRequest) -> Result<(), ApiError> {
    if ucast.appid.is_empty() {
        return Err(ERR_MISSING_ID_FIELD);
    }
    if ucast.token.is_empty() && (ucast.userid.is_empty() || ucast.deviceid.is_empty()) {
        return Err(ERR_MISSING_ID_FIELD);
    }
    Ok(())
}

fn do_unicast(state: &ApiState, ucast: UnicastRequest) -> Result<Value, ApiError> {
    check_unicast(&ucast)?;
    let expire = check_cast_common(&ucast.data, &ucast.expire_on)?;
    let chan = state
        .store
        .get_channel_id_from_token(&ucast.token, &ucast.appid, &ucast.userid, &ucast.deviceid)
        .map_err(|err| match err {
            StoreError::UnknownToken => ERR_UNKNOWN_TOKEN,
            StoreError::Unauthorized => ERR_UNAUTHORIZED,
            err => {
                tracing::error!("could not resolve token: {err}");
                ERR_COULD_NOT_RESOLVE_TOKEN
            }
        })?;

    let msg_id = (state.msg_id_gen)();
    let data = ucast.data.unwrap_or(Value::Null);
    if let Err(err) =
        state
            .store
            .append_to_unicast_channel(&chan, &ucast.appid, data, &msg_id, expire)
    {
        tracing::error!("could not store notification: {err}");
        return Err(ERR_COULD_NOT_STORE_NOTIFICATION);
    }

    state.broker.unicast(&chan);
    Ok(json!({}))
}

fn do_register(state: &ApiState, reg: RegisterRequest) -> Result<Value, ApiError> {
    if reg.deviceid.is_empty() || reg.appid.is_empty() {
        return Err(ERR_MISSING_ID_FIELD);
    }
    let token = state.store.register(&reg.deviceid, &reg.appid).map_err(|err| {
        tracing::error!("could not make a token: {err}");
        ERR_COULD_NOT_MAKE_TOKEN
    })?;
    Ok(json!({"token": token}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_ids_are_unique() {
        assert_ne!(generate_msg_id(), generate_msg_id());
    }

    #[test]
    fn cast_validation_order() {
        assert_eq!(check_cast_common(&None, "whatever"), Err(ERR_MISSING_DATA));
        assert_eq!(
            check_cast_common(&Some(json!({"a": 1})), "not-a-date"),
            Err(ERR_INVALID_EXPIRATION)
        );
        assert_eq!(
            check_cast_common(&Some(json!({"a": 1})), "2013-01-01T00:00:00Z"),
            Err(ERR_PAST_EXPIRATION)
        );
        assert!(check_cast_common(&Some(json!({"a": 1})), "2999-01-01T00:00:00Z").is_ok());
    }

    #[test]
    fn unicast_requires_addressing() {
        let mut ucast = UnicastRequest::default();
        assert_eq!(check_unicast(&ucast), Err(ERR_MISSING_ID_FIELD));

        ucast.appid = "app1".to_string();
        assert_eq!(check_unicast(&ucast), Err(ERR_MISSING_ID_FIELD));

        ucast.userid = "u1".to_string();
        ucast.deviceid = "d1".to_string();
        assert_eq!(check_unicast(&ucast), Ok(()));

        let tokened = UnicastRequest {
            appid: "app1".to_string(),
            token: "tok".to_string(),
            ..UnicastRequest::default()
        };
        assert_eq!(check_unicast(&tokened), Ok(()));
    }
}
