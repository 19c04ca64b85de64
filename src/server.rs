
use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use tower_http::cors::{AllowOrigin, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    auth,
    conf::{self, Conf},
    data::Storage,
    docs::ApiDoc,
    quota::{Admit, Gate, QuotaError, UserStore},
    types::{ErrorResponse, UsageStats},
};

pub const DB_FILE: &str = "data/data.db";

const MAX_BODY_SIZE: usize = 1024 * 1024 * 10; // 10MB limit

#[derive(Debug)]
pub struct ApiError(StatusCode, Json<ErrorResponse>);

impl ApiError {
    fn new(status: StatusCode, message: &str) -> Self {
        Self(
            status,
            Json(ErrorResponse {
                message: message.to_string(),
            }),
        )
    }
}

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        Self::new(status, status.canonical_reason().unwrap_or("Unknown error"))
    }
}

impl From<QuotaError> for ApiError {
    fn from(error: QuotaError) -> Self {
        match error {
            QuotaError::InvalidInput => {
                tracing::warn!("Rejected: no text.");
                Self::new(StatusCode::BAD_REQUEST, "Text is required.")
            }
            QuotaError::UserNotFound => {
                tracing::warn!("Rejected: unknown user.");
                Self::new(StatusCode::NOT_FOUND, "User not found.")
            }
            QuotaError::QuotaExceeded {
                requested,
                used,
                limit,
            } => {
                tracing::warn!(requested, used, limit, "Rejected: word limit.");
                Self::new(
                    StatusCode::PAYMENT_REQUIRED,
                    "Word limit exceeded. Payment required.",
                )
            }
            QuotaError::Persistence(error) => {
                tracing::error!(?error, "Failed to check word limit.");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error.",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError(status, body) = self;
        (status, body).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Conf>,
    pub storage: Storage,
    pub gate: Gate,
    pub client: reqwest::Client,

    /// Wall clock the quota day is read from.
    pub clock: fn() -> DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(conf: Arc<Conf>, storage: Storage) -> Self {
        let gate = Gate::from_conf(&conf);
        Self {
            conf,
            storage,
            gate,
            client: reqwest::Client::new(),
            clock: Utc::now,
        }
    }
}

#[tracing::instrument(name = "server", skip_all)]
pub async fn run() -> anyhow::Result<()> {
    let conf = conf::global();
    let dir = env::current_dir()?;
    tracing::info!(?dir, ?conf, "Starting.");
    let addr = SocketAddr::from((conf.addr, conf.port));
    let busy_timeout = Duration::from_secs_f32(conf.sqlite_busy_timeout);
    let storage = Storage::connect(DB_FILE, busy_timeout).await?;
    let state = AppState::new(conf.clone(), storage);
    let service =
        router(state).into_make_service_with_connect_info::<SocketAddr>();

    match &conf.tls {
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::warn!(?addr, "Listening unencrypted.");
            axum::serve(listener, service).await?;
        }
        Some(conf::Tls {
            cert_file,
            key_file,
        }) => {
            // XXX One MUST do this manual init of rustls provider when using
            //     more than a single dep which itself depends on rustls.
            //     Here we using 2:
            //     - axum_server
            //     - reqwest
            rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .map_err(|crypto_provider| {
                    anyhow!(
                        "Failed to install default crypto provider: \
                        {crypto_provider:?}"
                    )
                })?;

            let config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    cert_file, key_file,
                )
                .await
                .context(format!(
                    "Failed to construct RustlsConfig. \
                    cert_file={cert_file:?}, key_file={key_file:?}"
                ))?;

            tracing::info!(
                ?addr,
                ?cert_file,
                ?key_file,
                "Listening with TLS."
            );
            axum_server::bind_rustls(addr, config)
                .serve(service)
                .await?;
        }
    }

    Ok(())
}

pub fn router(state: AppState) -> axum::Router {
    let cors = cors_layer(&state.conf.cors_origins);
    let text = post(handle_text).route_layer(middleware::from_fn_with_state(
        state.clone(),
        quota_layer,
    ));
    let authenticated = axum::Router::new()
        .route("/text", text)
        .route("/usage", get(usage_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_layer));
    axum::Router::new()
        .route("/health", get(health_check))
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .merge(authenticated)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(cors)
        .layer(middleware::from_fn(|req: Request, next: Next| {
            REQ_ID.scope(ReqId::new(), next.run(req))
        }))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin
                .parse()
                .inspect_err(|error| {
                    tracing::warn!(?origin, ?error, "Ignoring CORS origin.");
                })
                .ok()
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ])
        .allow_credentials(true)
        .expose_headers([header::CONTENT_TYPE, header::CONTENT_LENGTH])
}

/// Charges the request body against the caller's daily word quota before
/// letting it through to the handler.
#[tracing::instrument(
    name = "quota",
    skip_all,
    fields(req_id = %req_id(), uid = %uid())
)]
async fn quota_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = current_user()?;
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|error| {
            tracing::warn!(?error, "Failed to read request body.");
            StatusCode::BAD_REQUEST
        })?;
    let text = std::str::from_utf8(&bytes).map_err(|error| {
        tracing::warn!(?error, "Request body is not UTF-8.");
        QuotaError::InvalidInput
    })?;
    let admit = state
        .gate
        .evaluate(&state.storage, &user.uid, text, (state.clock)())
        .await?;
    tracing::info!(?admit, "Admitted.");
    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(admit);
    Ok(next.run(req).await)
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %req_id(), uid = %uid())
)]
#[utoipa::path(
    post,
    path = "/text",
    request_body(
        content = String,
        content_type = "text/plain",
        description = "Text charged against the caller's daily word quota. \
            Words are counted between single spaces."
    ),
    responses(
        (status = 200, description = "Admitted. Upstream response, or the admission summary when no upstream is configured.", body = Admit),
        (status = 400, description = "Text is empty", body = ErrorResponse),
        (status = 401, description = "Missing or invalid JWT token", body = ErrorResponse),
        (status = 402, description = "Daily word limit exceeded", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse),
        (status = 502, description = "Upstream unreachable", body = ErrorResponse),
    ),
    security(
        ("jwt" = [])
    )
)]
pub async fn handle_text(
    State(state): State<AppState>,
    Extension(admit): Extension<Admit>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Some(target) = &state.conf.target else {
        return Ok(Json(admit).into_response());
    };

    tracing::debug!(url = ?target.url, "Forwarding admitted text.");
    let mut request = state
        .client
        .post(&target.url)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body);
    if !target.auth_token.is_empty() {
        request = request.bearer_auth(&target.auth_token);
    }
    let response = request.send().await.map_err(|error| {
        tracing::error!(?error, "Failed to forward request.");
        StatusCode::BAD_GATEWAY
    })?;

    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let body_bytes = response.bytes().await.map_err(|error| {
        tracing::error!(?error, "Failed to read upstream response body.");
        StatusCode::BAD_GATEWAY
    })?;

    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    let response = builder.body(Body::from(body_bytes)).map_err(|error| {
        tracing::error!(?error, "Failed to create response.");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(response)
}

#[tracing::instrument(
    skip_all,
    fields(req_id = %req_id(), uid = %uid())
)]
#[utoipa::path(
    get,
    path = "/usage",
    responses(
        (status = 200, description = "Caller's usage for the current UTC day", body = UsageStats),
        (status = 401, description = "Missing or invalid JWT token", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse),
    ),
    security(
        ("jwt" = [])
    )
)]
pub async fn usage_handler(
    State(state): State<AppState>,
) -> Result<Json<UsageStats>, ApiError> {
    let user = current_user()?;
    let record = state
        .storage
        .find_by_identity(&user.uid)
        .await
        .map_err(QuotaError::from)?
        .ok_or(QuotaError::UserNotFound)?;
    Ok(Json(state.gate.usage(&record, (state.clock)())))
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Clone)]
struct User {
    pub uid: String,
}

#[derive(Debug, Clone)]
struct ReqId {
    pub req_id: String,
}

impl ReqId {
    fn new() -> Self {
        let req_id = cuid2::create_id();
        Self { req_id }
    }
}

tokio::task_local! {
    static USER: User;
    static REQ_ID: ReqId;
}

fn req_id() -> String {
    REQ_ID
        .try_with(|id| id.req_id.clone())
        .unwrap_or_default()
}

fn uid() -> String {
    USER.try_with(|user| user.uid.clone()).unwrap_or_default()
}

fn current_user() -> Result<User, ApiError> {
    USER.try_with(User::clone).map_err(|error| {
        tracing::error!(?error, "No authenticated user in scope.");
        ApiError::from(StatusCode::INTERNAL_SERVER_ERROR)
    })
}

async fn auth_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let unauthorized = || {
        ApiError::new(StatusCode::UNAUTHORIZED, "Missing or invalid token.")
    };
    let auth_token = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| {
            tracing::warn!("Missing Authorization header");
            unauthorized()
        })?
        .to_str()
        .map_err(|error| {
            tracing::warn!(?error, "Invalid Authorization header encoding");
            unauthorized()
        })?
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            tracing::warn!("Authorization header missing 'Bearer ' prefix");
            unauthorized()
        })?;

    match authorize(auth_token, &state.conf.jwt) {
        Some(user) => {
            tracing::debug!(uid = ?user.uid, "User authenticated.");
            Ok(USER.scope(user, next.run(req)).await)
        }
        None => Err(unauthorized()),
    }
}

fn authorize(auth_token: &str, jwt_conf: &conf::ConfJwt) -> Option<User> {
    auth::Claims::from_str(auth_token, jwt_conf)
        .inspect_err(|error| {
            tracing::warn!(
                ?error,
                token_prefix = ?auth_token.get(..10).unwrap_or(""),
                "JWT validation failed"
            );
        })
        .ok()
        .map(|claims| User { uid: claims.sub })
}
