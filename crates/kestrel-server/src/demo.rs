//! Demo service served by `kestrel provider`.

use crate::service::{ServiceInstance, ServiceRegistry};

pub const CLASS_NAME: &str = "DemoService";
pub const VERSION: &str = "1.0.0";
pub const GROUP: &str = "test";

/// `DemoService`:
/// - `sayHello(String) -> "Hello " + name`
/// - `add(int, int) -> a + b`
/// - `fail(String)` always fails with the given message
pub fn service() -> ServiceInstance {
    ServiceInstance::new(CLASS_NAME)
        .method("sayHello", &["String"], |(name,): (String,)| {
            Ok(format!("Hello {}", name))
        })
        .method("add", &["int", "int"], |(a, b): (i64, i64)| {
            a.checked_add(b)
                .ok_or_else(|| anyhow::anyhow!("integer overflow adding {} and {}", a, b))
        })
        .method("fail", &["String"], |(message,): (String,)| -> anyhow::Result<()> {
            anyhow::bail!(message)
        })
}

/// Registry holding [`service`] under `DemoService#1.0.0#test`.
pub fn registry() -> ServiceRegistry {
    ServiceRegistry::new().with_service(VERSION, GROUP, service())
}
