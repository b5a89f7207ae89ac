//! Read-only HTTP transport used by the JSON adapter.
//!
//! Adapters talk to an [`HttpClient`] rather than to reqwest directly so tests
//! can script provider responses without a network.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::data_source::SourceError;
use crate::Credential;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_SNIPPET_CHARS: usize = 200;

/// How a provider expects its credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    BearerToken(Credential),
    Header { name: String, value: Credential },
}

/// A GET request with lowercase header names and an encoded query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Appends `name=value` to the query string, percent-encoding the value.
    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        self.url = format!(
            "{}{separator}{name}={}",
            self.url,
            urlencoding::encode(value)
        );
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into().to_ascii_lowercase();
        self.headers.insert(name, value.into());
        self
    }

    pub fn with_auth(self, auth: &HttpAuth) -> Self {
        match auth {
            HttpAuth::None => self,
            HttpAuth::BearerToken(token) => {
                self.with_header("authorization", format!("Bearer {}", token.expose()))
            }
            HttpAuth::Header { name, value } => self.with_header(name.as_str(), value.expose()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub const fn is_success(&self) -> bool {
        matches!(self.status, 200..=299)
    }

    /// Maps a non-2xx status onto the provider error taxonomy.
    pub fn status_error(&self) -> SourceError {
        if matches!(self.status, 401 | 403) {
            return SourceError::authentication(format!(
                "provider rejected credentials (status {})",
                self.status
            ));
        }

        let snippet = self
            .body
            .chars()
            .take(STATUS_SNIPPET_CHARS)
            .collect::<String>();
        SourceError::provider_status(
            self.status,
            format!("provider returned status {}: {snippet}", self.status),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    Timeout,
    Connect,
    Other,
}

/// Failure below the HTTP status level: no usable response arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    kind: HttpErrorKind,
    message: String,
}

impl HttpError {
    pub fn new(kind: HttpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> HttpErrorKind {
        self.kind
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HttpError {}

impl From<reqwest::Error> for HttpError {
    fn from(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            HttpErrorKind::Timeout
        } else if error.is_connect() {
            HttpErrorKind::Connect
        } else {
            HttpErrorKind::Other
        };
        Self::new(kind, error.to_string())
    }
}

impl From<HttpError> for SourceError {
    fn from(error: HttpError) -> Self {
        match error.kind {
            HttpErrorKind::Timeout => Self::timeout(error.message),
            HttpErrorKind::Connect | HttpErrorKind::Other => Self::unreachable(error.message),
        }
    }
}

pub type HttpFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;

pub trait HttpClient: Send + Sync {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a>;
}

/// reqwest-backed transport (rustls).
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shopwire/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_client(client)
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
        Box::pin(async move {
            let builder = request
                .headers
                .iter()
                .fold(self.client.get(&request.url), |builder, (name, value)| {
                    builder.header(name, value)
                })
                .timeout(request.timeout);

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok(HttpResponse { status, body })
        })
    }
}
