//! Application boundary.
//!
//! The server never knows what an application does. It resolves an
//! [`AppRef`] (`module:object`) through an [`AppRegistry`] that the binary
//! builds up front, and each worker process builds its own [`Handler`] from
//! the registered factory. Handlers run on the worker's single-threaded event
//! loop, so they need not be `Send`.

pub mod builtin;
pub mod response;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Bytes;

use crate::error::ConfigError;

/// A request with its body fully collected
pub type Request = http::Request<Bytes>;
pub type Response = http::Response<Full<Bytes>>;
pub type HandlerFuture = LocalBoxFuture<'static, Result<Response, RequestError>>;

/// Asynchronous request to response processor.
pub trait Handler {
    fn call(&self, request: Request) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<Response, RequestError>> + 'static,
{
    fn call(&self, request: Request) -> HandlerFuture {
        self(request).boxed_local()
    }
}

/// Failure local to one request; it becomes that request's response.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("failed to read request body: {0}")]
    Body(String),
    #[error("{message}")]
    Status { status: StatusCode, message: String },
    #[error("handler panicked: {0}")]
    Panic(String),
}

impl RequestError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::Status { status, .. } => *status,
            Self::Panic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error response sent to the client. Panic details stay in the logs.
    pub fn into_response(self) -> Response {
        match self {
            Self::Status { status, message } if !status.is_server_error() => {
                response::build_text_response(status, message)
            }
            other => response::build_error_response(other.status()),
        }
    }
}

/// `module:object` reference naming an application
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppRef {
    module: String,
    object: String,
}

impl AppRef {
    pub fn new(module: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            object: object.into(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn object(&self) -> &str {
        &self.object
    }
}

impl FromStr for AppRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once(':') {
            Some((module, object))
                if !module.is_empty() && !object.is_empty() && !object.contains(':') =>
            {
                Ok(Self::new(module, object))
            }
            _ => Err(ConfigError::InvalidAppRef(s.to_string())),
        }
    }
}

impl fmt::Display for AppRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.object)
    }
}

type Factory = Arc<dyn Fn() -> Rc<dyn Handler> + Send + Sync>;

/// Builds a fresh handler inside a worker process
#[derive(Clone)]
pub struct AppFactory(Factory);

impl AppFactory {
    pub fn build(&self) -> Rc<dyn Handler> {
        (self.0)()
    }
}

impl fmt::Debug for AppFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AppFactory")
    }
}

/// Applications known to this binary, keyed by reference
#[derive(Clone, Default)]
pub struct AppRegistry {
    apps: BTreeMap<AppRef, Factory>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `builtin:echo` and `builtin:hello`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert(AppRef::new("builtin", "echo"), || builtin::echo);
        registry.insert(AppRef::new("builtin", "hello"), || builtin::hello);
        registry
    }

    pub fn register<F, H>(&mut self, app: &str, factory: F) -> Result<&mut Self, ConfigError>
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        let app = app.parse()?;
        self.insert(app, factory);
        Ok(self)
    }

    fn insert<F, H>(&mut self, app: AppRef, factory: F)
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        let factory: Factory = Arc::new(move || Rc::new(factory()) as Rc<dyn Handler>);
        self.apps.insert(app, factory);
    }

    pub fn resolve(&self, app: &AppRef) -> Result<AppFactory, ConfigError> {
        self.apps
            .get(app)
            .map(|factory| AppFactory(Arc::clone(factory)))
            .ok_or_else(|| ConfigError::UnknownApp {
                name: app.to_string(),
                available: self.names().collect::<Vec<_>>().join(", "),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        self.apps.keys().map(ToString::to_string)
    }
}

impl fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}
