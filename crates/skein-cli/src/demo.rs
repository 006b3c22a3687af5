//! Demo service exposed by `skein serve`.

use serde_json::Value;
use skein_core::{RpcError, ServiceDefinition};
use std::time::Duration;

/// Interface name of the demo service.
pub const INTERFACE: &str = "skein.demo.Echo";

/// Upper bound for `sleep`, so a stray call cannot pin a worker for long.
const MAX_SLEEP: Duration = Duration::from_secs(60);

pub fn echo_service() -> ServiceDefinition {
    ServiceDefinition::new(INTERFACE)
        .method("echo", 1, |params| Ok(params.into_iter().next().unwrap_or(Value::Null)))
        .typed_method("add", 2, |(a, b): (f64, f64)| Ok(a + b))
        .typed_method("concat", 2, |(a, b): (String, String)| Ok(a + &b))
        .typed_method("sleep", 1, |(ms,): (u64,)| {
            let delay = Duration::from_millis(ms).min(MAX_SLEEP);
            std::thread::sleep(delay);
            Ok(delay.as_millis() as u64)
        })
        .method("fail", 1, |params| {
            let message = params
                .first()
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            Err(RpcError::Other(message.to_string()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_core::{MethodRegistry, Request};

    #[test]
    fn test_demo_methods() {
        let registry = MethodRegistry::build("0.0.1", vec![echo_service()]).unwrap();
        let service = format!("{}_0.0.1", INTERFACE);

        let add = registry.dispatch(Request::new("1", &service, "add(2)", vec![json!(1.5), json!(2)]));
        assert_eq!(add.result, json!(3.5));

        let concat = registry.dispatch(Request::new(
            "2",
            &service,
            "concat(2)",
            vec![json!("sk"), json!("ein")],
        ));
        assert_eq!(concat.result, json!("skein"));

        let fail = registry.dispatch(Request::new("3", &service, "fail(1)", vec![json!("nope")]));
        assert!(fail.has_error);
        assert!(fail.error.unwrap().message.contains("nope"));
    }
}
