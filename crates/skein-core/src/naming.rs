//! Name construction shared by consumers and providers.
//!
//! Both sides must build identical strings, so all formatting lives here.

use uuid::Uuid;

/// `"{interface}_{version}"`.
pub fn service_name(interface: &str, version: &str) -> String {
    format!("{}_{}", interface, version)
}

/// `"{name}({arity})"`.
///
/// Only the parameter count is encoded, so overloads with the same name and
/// arity cannot be told apart.
pub fn method_signature(name: &str, arity: usize) -> String {
    format!("{}({})", name, arity)
}

/// Registry key for one method of one service.
pub fn service_method_key(service: &str, signature: &str) -> String {
    format!("{}:{}", service, signature)
}

/// `"{host}:{port}"`.
pub fn address(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// Fresh request identifier.
pub fn request_id() -> String {
    Uuid::new_v4().simple().to_string()
}
