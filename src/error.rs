//! Error taxonomy and HTTP error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

use crate::pages;

/// Errors raised by the record store, the supervisor, the daemonizer, the
/// domain registry and the certificate cache.
#[derive(Debug, Error)]
pub enum Error {
    /// Another live process already claims this record identity
    #[error("the process is already running with PID {pid}")]
    AlreadyRunning { pid: u32 },

    /// The command died inside the relief window
    #[error("command \"{command}\" failed early: {reason}")]
    BootFailure { command: String, reason: String },

    /// The detached copy of the current process could not be spawned
    #[error("unable to respawn in the background: {0}")]
    RespawnFailure(String),

    /// A filesystem watch could not be established
    #[error("unable to watch \"{}\": {source}", .path.display())]
    WatchFailure {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// A domain token carries the TLD suffix
    #[error("domain \"{domain}\" must not end with the \".{tld}\" TLD, please remove the TLD")]
    DomainValidation { domain: String, tld: String },

    /// The local CA could not issue a leaf certificate
    #[error("unable to issue a certificate for \"{domain}\": {reason}")]
    CertIssuance { domain: String, reason: String },

    /// The hostname is not linked to any project directory
    #[error("hostname \"{host}\" is not linked to a directory")]
    UnregisteredDomain { host: String },

    /// The project is known but its web server is not running
    #[error("web server for \"{dir}\" is not running")]
    BackendNotRunning { host: String, dir: String },

    /// The supervised command exited unsuccessfully
    #[error("command \"{command}\" exited with {status}")]
    CommandFailed { command: String, status: ExitStatus },

    /// The background process exited before reaching "up"
    #[error("the background process exited with status {0}")]
    DaemonExited(i32),

    /// The background process stopped reporting progress
    #[error("timed out waiting for the background process to report progress")]
    DaemonTimeout,

    /// The command binary is not on PATH
    #[error("command \"{0}\" not found")]
    BinaryNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Kinds of locally rendered proxy responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Request without any Host header
    MissingHostHeader,
    /// Scheme and port do not agree (https on non-443, http on non-80)
    WrongPort,
    /// Hostname is not linked to a project directory
    UnregisteredDomain,
    /// Project found but its web server is down
    BackendNotRunning,
    /// Path served by the proxy itself does not exist
    NotFound,
    /// The backend refused or dropped the forwarded request
    ConnectionFailed,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::WrongPort => StatusCode::NOT_FOUND,
            ProxyErrorCode::UnregisteredDomain => StatusCode::NOT_FOUND,
            ProxyErrorCode::BackendNotRunning => StatusCode::NOT_FOUND,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value of the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::WrongPort => "WRONG_PORT",
            ProxyErrorCode::UnregisteredDomain => "UNREGISTERED_DOMAIN",
            ProxyErrorCode::BackendNotRunning => "BACKEND_NOT_RUNNING",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// Plain text error response with X-Proxy-Error header
pub fn text_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    build_response(code, "text/plain; charset=utf-8", message.into())
}

/// HTML error page with a title and an already-escaped guidance block
pub fn html_error_response(
    code: ProxyErrorCode,
    title: &str,
    guidance_html: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    build_response(
        code,
        "text/html; charset=utf-8",
        pages::error_page(title, guidance_html),
    )
}

fn build_response(
    code: ProxyErrorCode,
    content_type: &'static str,
    body: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response.headers_mut().insert(
        "X-Proxy-Error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}
