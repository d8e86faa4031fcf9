//! Applications: named, optionally versioned bundles of method and event
//! handlers.
//!
//! Handlers are looked up by `(interface, name)` at call time. Methods
//! declare how many arguments they take; a call whose argument count differs
//! is answered with `invalid-signature` without running the handler.

use crate::Connection;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use switchboard_core::{ErrorCode, RemoteError, Version, parse_version};

/// What a method handler produces: the values of an `ok` callback, or an
/// error sent back to the caller.
pub type MethodResult = Result<Vec<Value>, RemoteError>;

type MethodFn = dyn Fn(Connection, Vec<Value>) -> BoxFuture<'static, MethodResult> + Send + Sync;
type EventFn = dyn Fn(Connection, Vec<Value>) + Send + Sync;

/// A remotely callable method.
#[derive(Clone)]
pub struct Method {
    arity: usize,
    handler: Arc<MethodFn>,
}

impl Method {
    /// Wrap an async handler taking exactly `arity` arguments.
    pub fn new<F, Fut>(arity: usize, handler: F) -> Self
    where
        F: Fn(Connection, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let handler: Arc<MethodFn> = Arc::new(
            move |connection: Connection, args: Vec<Value>| -> BoxFuture<'static, MethodResult> {
                Box::pin(handler(connection, args))
            },
        );
        Self { arity, handler }
    }

    /// Number of arguments the method expects.
    pub fn arity(&self) -> usize {
        self.arity
    }

    pub(crate) fn invoke(&self, connection: Connection, args: Vec<Value>) -> BoxFuture<'static, MethodResult> {
        (self.handler)(connection, args)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method").field("arity", &self.arity).finish_non_exhaustive()
    }
}

/// Error building an application or an application index.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid semver version '{version}' for application '{name}'")]
    InvalidVersion { name: String, version: String },
    #[error("multiple entries of '{0}' without version")]
    DuplicateLatest(String),
    #[error("application '{name}' registered twice with version {version}")]
    DuplicateVersion { name: String, version: String },
}

/// An immutable application.
pub struct Application {
    name: String,
    version: Option<Version>,
    api: HashMap<String, BTreeMap<String, Method>>,
    event_handlers: HashMap<String, HashMap<String, Arc<EventFn>>>,
}

impl Application {
    /// Start building an application. The name may carry a version as
    /// `name@1.2.3`, which takes precedence over [`ApplicationBuilder::version`].
    pub fn builder(name: impl Into<String>) -> ApplicationBuilder {
        ApplicationBuilder {
            name: name.into(),
            version: None,
            api: HashMap::new(),
            event_handlers: HashMap::new(),
        }
    }

    /// An application with no interfaces, used by clients that expose nothing.
    pub fn empty() -> Self {
        Self {
            name: "switchboard".to_string(),
            version: None,
            api: HashMap::new(),
            event_handlers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Resolve a method for a call carrying `argc` arguments.
    pub fn resolve_method(&self, interface: &str, method: &str, argc: usize) -> Result<&Method, RemoteError> {
        let methods = self
            .api
            .get(interface)
            .ok_or_else(|| RemoteError::new(ErrorCode::InterfaceNotFound))?;
        let method = methods
            .get(method)
            .ok_or_else(|| RemoteError::new(ErrorCode::MethodNotFound))?;
        if method.arity != argc {
            return Err(RemoteError::new(ErrorCode::InvalidSignature));
        }
        Ok(method)
    }

    /// Method names of an interface, sorted, or `None` if it doesn't exist.
    pub fn methods(&self, interface: &str) -> Option<Vec<String>> {
        self.api
            .get(interface)
            .map(|methods| methods.keys().cloned().collect())
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.api.keys().map(String::as_str)
    }

    /// Run the event handler for `interface.event`, if one is declared.
    ///
    /// Returns whether a handler ran.
    pub fn handle_event(&self, connection: &Connection, interface: &str, event: &str, args: Vec<Value>) -> bool {
        let Some(handler) = self
            .event_handlers
            .get(interface)
            .and_then(|handlers| handlers.get(event))
        else {
            return false;
        };
        handler(connection.clone(), args);
        true
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("version", &self.version.as_ref().map(ToString::to_string))
            .field("interfaces", &self.api.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Application`].
pub struct ApplicationBuilder {
    name: String,
    version: Option<String>,
    api: HashMap<String, BTreeMap<String, Method>>,
    event_handlers: HashMap<String, HashMap<String, Arc<EventFn>>>,
}

impl ApplicationBuilder {
    /// Set the exact version, unless the name already carries one.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Register an async method taking `arity` arguments.
    pub fn method<F, Fut>(self, interface: &str, name: &str, arity: usize, handler: F) -> Self
    where
        F: Fn(Connection, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.with_method(interface, name, Method::new(arity, handler))
    }

    pub fn with_method(mut self, interface: &str, name: &str, method: Method) -> Self {
        self.api
            .entry(interface.to_string())
            .or_default()
            .insert(name.to_string(), method);
        self
    }

    /// Register an interface with no methods yet; it still shows up in inspect.
    pub fn interface(mut self, interface: &str) -> Self {
        self.api.entry(interface.to_string()).or_default();
        self
    }

    /// Register a handler for events the peer emits on `interface`.
    pub fn event_handler<F>(mut self, interface: &str, event: &str, handler: F) -> Self
    where
        F: Fn(Connection, Vec<Value>) + Send + Sync + 'static,
    {
        self.event_handlers
            .entry(interface.to_string())
            .or_default()
            .insert(event.to_string(), Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Application, RegistryError> {
        let split = self
            .name
            .rsplit_once('@')
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, version)| (name.to_string(), version.to_string()));
        let (name, version) = match split {
            Some((name, version)) => (name, Some(version)),
            None => (self.name, self.version),
        };

        let version = version
            .map(|v| {
                parse_version(&v).ok_or_else(|| RegistryError::InvalidVersion {
                    name: name.clone(),
                    version: v,
                })
            })
            .transpose()?;

        Ok(Application {
            name,
            version,
            api: self.api,
            event_handlers: self.event_handlers,
        })
    }
}
