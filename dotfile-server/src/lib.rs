//! Dotfile hosted service
//!
//! HTTP surface over the SQLite backend. Owners are trusted as given in the
//! path; authentication lives in front of this service.

pub mod routes;

use bytes::Bytes;
use chrono::{FixedOffset, Offset, Utc};
use dotfile_core::staging::{self, UploadedBlob};
use dotfile_core::{scoped, Backend, CommitSummary, EngineError, SqliteBackend};
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use routes::{json, json_error, respond, resolve, Route, RouteError};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Path segments served by fixed routes; never valid as an owner name
pub const STATIC_ROUTES: &[&str] = &[
    "about", "explore", "signup", "login", "logout", "email", "password", "new_file", "api",
];

/// Header carrying the tracked path on first upload
pub const PATH_HEADER: &str = "x-dotfile-path";
/// Header carrying the commit message
pub const MESSAGE_HEADER: &str = "x-dotfile-message";
/// Response header naming the revision served
pub const HASH_HEADER: &str = "x-dotfile-hash";

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file
    pub database: PathBuf,
    /// Offset used when formatting listing timestamps
    pub utc_offset: FixedOffset,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Enable debug logging
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("dotfilehub.db"),
            utc_offset: Utc.fix(),
            max_body_size: 1024 * 1024, // 1 MB
            debug: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found")]
    NotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound => StatusCode::NOT_FOUND,
            ServerError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ServerError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Engine(e) => match e {
                EngineError::InvalidName(_) => StatusCode::BAD_REQUEST,
                EngineError::NotFound(_)
                | EngineError::NotTracked(_)
                | EngineError::UnknownRevision { .. } => StatusCode::NOT_FOUND,
                EngineError::AlreadyTracked(_) | EngineError::NoChanges(_) => StatusCode::CONFLICT,
                EngineError::CorruptPayload(_)
                | EngineError::Integrity { .. }
                | EngineError::Staging { .. }
                | EngineError::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<RouteError> for ServerError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::NotFound => ServerError::NotFound,
            RouteError::MethodNotAllowed => ServerError::MethodNotAllowed,
            RouteError::BadHash(hash) => {
                ServerError::InvalidRequest(format!("invalid revision {:?}", hash))
            }
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct SignupRequest {
    username: String,
}

/// Result of a PUT upload
enum Upload {
    Created(CommitSummary),
    Committed(CommitSummary),
    MissingPath,
}

/// Request handler shared by every connection
pub struct Service {
    backend: Arc<SqliteBackend>,
    config: Config,
}

impl Service {
    /// Open the configured database and reserve the static route names
    pub fn open(config: Config) -> Result<Self, ServerError> {
        let backend = SqliteBackend::open(&config.database)?;
        Self::with_backend(backend, config)
    }

    pub fn with_backend(backend: SqliteBackend, config: Config) -> Result<Self, ServerError> {
        backend.seed_reserved(STATIC_ROUTES)?;
        tracing::info!("Reserved {} static route names", STATIC_ROUTES.len());
        Ok(Self {
            backend: Arc::new(backend),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle an incoming HTTP request
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.config.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let err = if e.is::<http_body_util::LengthLimitError>() {
                    ServerError::PayloadTooLarge(self.config.max_body_size)
                } else {
                    ServerError::InvalidRequest(format!("failed to read body: {}", e))
                };
                return error_response(&err);
            }
        };
        self.dispatch(&parts.method, &parts.uri, &parts.headers, body).await
    }

    /// Route a request whose body has already been read
    pub async fn dispatch(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response<Full<Bytes>> {
        tracing::debug!("Request: {} {}", method, uri);
        let response = match self.route(method, uri, headers, body).await {
            Ok(response) => response,
            Err(e) => {
                if e.status().is_server_error() {
                    tracing::error!("{} {} failed: {}", method, uri, e);
                }
                error_response(&e)
            }
        };
        tracing::info!("{} {} -> {}", method, uri.path(), response.status().as_u16());
        response
    }

    async fn route(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>, ServerError> {
        match resolve(method, uri.path(), STATIC_ROUTES)? {
            Route::Signup => {
                let request: SignupRequest = serde_json::from_slice(&body)
                    .map_err(|e| ServerError::InvalidRequest(format!("Invalid JSON: {}", e)))?;
                let username = request.username.trim().to_string();
                let created = username.clone();
                self.blocking(move |backend| backend.register_owner(&username)).await?;
                Ok(json(StatusCode::CREATED, &serde_json::json!({ "username": created })))
            }

            Route::Owner { owner } => {
                let offset = self.config.utc_offset;
                let files = self.blocking(move |backend| backend.summaries(&owner, &offset)).await?;
                Ok(json(StatusCode::OK, &files))
            }

            Route::File { owner, alias } if *method == Method::GET => {
                let as_json = uri.query().is_some_and(|q| {
                    routes::parse_query(q).get("format").map(String::as_str) == Some("json")
                });
                let snapshot = self
                    .blocking(move |backend| {
                        scoped(backend.open(&owner, &alias)?, |file| file.snapshot())
                    })
                    .await?;
                if as_json {
                    return Ok(json(StatusCode::OK, &snapshot));
                }
                let hash = snapshot.hash.to_hex();
                let mut response =
                    respond(StatusCode::OK, "text/plain; charset=utf-8", snapshot.content);
                if let Ok(value) = hash.parse() {
                    response.headers_mut().insert(HASH_HEADER, value);
                }
                Ok(response)
            }

            Route::File { owner, alias } if *method == Method::PUT => {
                let path = header(headers, PATH_HEADER)?;
                let message = header(headers, MESSAGE_HEADER)?.unwrap_or_default();
                let content = body.to_vec();
                let upload = self
                    .blocking(move |backend| {
                        scoped(backend.track(&owner, &alias)?, |file| {
                            if file.is_tracked()? {
                                let mut blob = UploadedBlob::new(file.path()?, content);
                                let summary = staging::commit_from(file, &mut blob, &message)?;
                                return Ok(Upload::Committed(summary));
                            }
                            let Some(path) = path else {
                                return Ok(Upload::MissingPath);
                            };
                            let mut blob = UploadedBlob::new(path, content);
                            Ok(Upload::Created(staging::init_from(file, &mut blob)?))
                        })
                    })
                    .await?;
                match upload {
                    Upload::Created(summary) => Ok(json(StatusCode::CREATED, &summary)),
                    Upload::Committed(summary) => Ok(json(StatusCode::OK, &summary)),
                    Upload::MissingPath => Err(ServerError::InvalidRequest(format!(
                        "{} header is required for a new file",
                        PATH_HEADER
                    ))),
                }
            }

            Route::File { owner, alias } => {
                self.blocking(move |backend| backend.remove(&owner, &alias)).await?;
                Ok(routes::empty(StatusCode::NO_CONTENT))
            }

            Route::Commits { owner, alias } => {
                let data = self
                    .blocking(move |backend| {
                        scoped(backend.open(&owner, &alias)?, |file| file.tracking_data())
                    })
                    .await?;
                Ok(json(StatusCode::OK, &data))
            }

            Route::Revision { owner, alias, hash } => {
                let content = self
                    .blocking(move |backend| {
                        scoped(backend.open(&owner, &alias)?, |file| file.content_at(&hash))
                    })
                    .await?;
                Ok(respond(StatusCode::OK, "text/plain; charset=utf-8", content))
            }

            Route::Checkout { owner, alias, hash } => {
                let current = self
                    .blocking(move |backend| {
                        scoped(backend.open(&owner, &alias)?, |file| {
                            file.checkout(&hash)?;
                            file.current()
                        })
                    })
                    .await?;
                Ok(json(StatusCode::OK, &current))
            }
        }
    }

    /// Run an engine call on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteBackend) -> dotfile_core::Result<T> + Send + 'static,
    {
        let backend = self.backend.clone();
        let result = tokio::task::spawn_blocking(move || f(&backend))
            .await
            .map_err(|e| ServerError::Task(e.to_string()))?;
        Ok(result?)
    }
}

/// Accept connections on `listener` and serve each one on its own task
pub async fn serve(listener: TcpListener, service: Arc<Service>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let handler = service_fn(move |req| {
                let service = service.clone();
                async move { Ok::<_, Infallible>(service.handle(req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                tracing::error!("Error serving connection from {}: {:?}", peer, e);
            }
        });
    }
}

fn header(headers: &HeaderMap, name: &str) -> Result<Option<String>, ServerError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.to_string()))
            .map_err(|_| ServerError::InvalidRequest(format!("{} must be visible ASCII", name))),
    }
}

fn error_response(e: &ServerError) -> Response<Full<Bytes>> {
    json_error(e.status(), &e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotfile_core::{EntityId, Fingerprint};

    #[test]
    fn test_engine_error_statuses() {
        let entity = EntityId::new("alice", "bashrc").unwrap();
        let status = |e: EngineError| ServerError::from(e).status();
        assert_eq!(status(EngineError::NotTracked(entity.clone())), StatusCode::NOT_FOUND);
        assert_eq!(status(EngineError::NotFound("owner".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(EngineError::UnknownRevision {
                entity: entity.clone(),
                fingerprint: Fingerprint::of(b"x")
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status(EngineError::AlreadyTracked(entity.clone())), StatusCode::CONFLICT);
        assert_eq!(status(EngineError::NoChanges(entity)), StatusCode::CONFLICT);
        assert_eq!(status(EngineError::InvalidName("".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(EngineError::CorruptPayload("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_static_routes_cover_signup() {
        assert!(STATIC_ROUTES.contains(&"signup"));
        assert!(STATIC_ROUTES.contains(&"api"));
    }
}
