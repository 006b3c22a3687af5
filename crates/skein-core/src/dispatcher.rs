//! Provider-side method registry and dispatch.
//!
//! Services are described with [`ServiceDefinition`] and frozen into a
//! [`MethodRegistry`] at startup. The registry is immutable afterwards and
//! shared by every worker without locking.

use crate::codec::{Request, Response};
use crate::config::WireConfig;
use crate::error::{RpcError, Result, CODE_INVOCATION, CODE_NO_METHOD, CODE_NO_PROVIDER};
use crate::naming;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// Callable target of one method.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
struct MethodDefinition {
    name: String,
    arity: usize,
    handler: Handler,
}

/// One service implementation and the interfaces it is exposed under.
#[derive(Clone)]
pub struct ServiceDefinition {
    interfaces: Vec<String>,
    methods: Vec<MethodDefinition>,
}

impl std::fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("interfaces", &self.interfaces)
            .field(
                "methods",
                &self
                    .methods
                    .iter()
                    .map(|m| naming::method_signature(&m.name, m.arity))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ServiceDefinition {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interfaces: vec![interface.into()],
            methods: Vec::new(),
        }
    }

    /// Also expose the same methods under another interface name.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Add a method taking raw JSON parameters.
    pub fn method<F>(mut self, name: impl Into<String>, arity: usize, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.push(MethodDefinition {
            name: name.into(),
            arity,
            handler: Arc::new(handler),
        });
        self
    }

    /// Add a method whose parameter list deserializes into `A` (usually a
    /// tuple) and whose return value serializes from `R`.
    pub fn typed_method<A, R, F>(self, name: impl Into<String>, arity: usize, handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        self.method(name, arity, move |params| {
            let args: A = serde_json::from_value(Value::Array(params)).map_err(|e| {
                RpcError::Json {
                    message: format!("invalid arguments: {}", e),
                    source: Some(e),
                }
            })?;
            Ok(serde_json::to_value(handler(args)?)?)
        })
    }

    /// Interfaces this definition is exposed under.
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }
}

/// Immutable map from `(service, method signature)` to handler.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    services: BTreeSet<String>,
    methods: HashMap<String, Handler>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("services", &self.services)
            .field("methods", &self.methods.len())
            .finish()
    }
}

impl MethodRegistry {
    /// Register every definition under `version`.
    ///
    /// Fails with [`RpcError::DuplicateMethod`] when two methods map to the
    /// same service and signature.
    pub fn build(version: &str, definitions: Vec<ServiceDefinition>) -> Result<Self> {
        let mut registry = Self::default();
        for definition in definitions {
            for interface in &definition.interfaces {
                let service = naming::service_name(interface, version);
                for method in &definition.methods {
                    let signature = naming::method_signature(&method.name, method.arity);
                    let key = naming::service_method_key(&service, &signature);
                    if registry.methods.contains_key(&key) {
                        return Err(RpcError::DuplicateMethod {
                            service,
                            method: signature,
                        });
                    }
                    debug!("Registered {}", key);
                    registry.methods.insert(key, Arc::clone(&method.handler));
                }
                registry.services.insert(service);
            }
        }
        Ok(registry)
    }

    /// Service names this registry answers for, sorted.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(String::as_str)
    }

    /// Whether `service` is registered.
    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains(service)
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Handle one request. Never panics and never fails: every outcome is a
    /// Response carrying the request's id.
    pub fn dispatch(&self, request: Request) -> Response {
        let Request {
            id,
            service,
            method,
            params,
        } = request;

        if service == WireConfig::HEALTH_SERVICE && method == WireConfig::HEALTH_METHOD {
            return Response::success(id, Value::from(WireConfig::HEALTH_RESULT));
        }

        if !self.services.contains(&service) {
            debug!("Request {} for unknown service {}", id, service);
            return Response::error(
                id,
                CODE_NO_PROVIDER,
                format!("no provider for service {}", service),
            );
        }

        let key = naming::service_method_key(&service, &method);
        let handler = match self.methods.get(&key) {
            Some(handler) => handler,
            None => {
                debug!("Request {} for unknown method {}", id, key);
                return Response::error(
                    id,
                    CODE_NO_METHOD,
                    format!("no such method {} on {}", method, service),
                );
            }
        };

        match catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(Ok(result)) => Response::success(id, result),
            Ok(Err(e)) => {
                error!("{} failed for request {}: {}", key, id, e);
                let code = match &e {
                    RpcError::Invocation { code, .. } => *code,
                    _ => CODE_INVOCATION,
                };
                Response::error(id, code, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("{} panicked for request {}: {}", key, id, message);
                Response::error(id, CODE_INVOCATION, format!("method panicked: {}", message))
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
