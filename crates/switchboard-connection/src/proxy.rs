//! Local stand-ins for remote interfaces.

use crate::connection::Connection;
use crate::error::Error;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

type Listener = Arc<dyn Fn(&[Value]) + Send + Sync>;
pub(crate) type Listeners = Arc<RwLock<HashMap<String, Vec<Listener>>>>;

/// One method of a remote interface.
#[derive(Clone)]
pub struct RemoteMethod {
    connection: Connection,
    interface: Arc<str>,
    name: Arc<str>,
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        self.connection.call_method(&self.interface, &self.name, args).await
    }

    pub fn call_detached(&self, args: Vec<Value>) -> Result<(), Error> {
        self.connection.call_method_detached(&self.interface, &self.name, args)
    }
}

impl fmt::Debug for RemoteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteMethod({}.{})", self.interface, self.name)
    }
}

/// A remote interface as discovered by inspect.
///
/// The method set is fixed when the proxy is built. The proxy is also an
/// event surface: [`RemoteProxy::emit`] sends the event to the peer and
/// notifies local listeners, while events arriving from the peer only reach
/// local listeners.
#[derive(Clone)]
pub struct RemoteProxy {
    connection: Connection,
    interface: Arc<str>,
    methods: Arc<BTreeMap<String, RemoteMethod>>,
    listeners: Listeners,
}

impl RemoteProxy {
    /// Proxies re-created for the same interface share `listeners`.
    pub(crate) fn new(
        connection: Connection,
        interface: &str,
        methods: Vec<String>,
        listeners: Option<Listeners>,
    ) -> Self {
        let interface: Arc<str> = Arc::from(interface);
        let methods = methods
            .into_iter()
            .map(|name| {
                let method = RemoteMethod {
                    connection: connection.clone(),
                    interface: interface.clone(),
                    name: Arc::from(name.as_str()),
                };
                (name, method)
            })
            .collect();

        Self {
            connection,
            interface,
            methods: Arc::new(methods),
            listeners: listeners.unwrap_or_default(),
        }
    }

    pub(crate) fn listeners(&self) -> Listeners {
        self.listeners.clone()
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method(&self, name: &str) -> Option<&RemoteMethod> {
        self.methods.get(name)
    }

    /// Call a method discovered at inspect time.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        self.lookup(name)?.call(args).await
    }

    pub fn call_detached(&self, name: &str, args: Vec<Value>) -> Result<(), Error> {
        self.lookup(name)?.call_detached(args)
    }

    fn lookup(&self, name: &str) -> Result<&RemoteMethod, Error> {
        self.methods.get(name).ok_or_else(|| Error::UnknownRemoteMethod {
            interface: self.interface.to_string(),
            method: name.to_string(),
        })
    }

    /// Listen for `event` on this interface.
    pub fn on<F>(&self, event: &str, listener: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Send `event` to the peer, then notify local listeners.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), Error> {
        self.connection
            .emit_remote_event(&self.interface, event, args.clone())?;
        self.emit_local(event, &args);
        Ok(())
    }

    pub(crate) fn emit_local(&self, event: &str, args: &[Value]) {
        let listeners: Vec<Listener> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            match listeners.get(event) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for listener in listeners {
            listener(args);
        }
    }
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("interface", &self.interface)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
