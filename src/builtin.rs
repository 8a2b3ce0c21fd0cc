//! Handlers shipped with the binary for smoke-testing a deployment.
//!
//! `Stevedore.echo` returns its arguments; `Stevedore.sleep` waits for the
//! given number of milliseconds, or fails when the value is negative.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use crate::registry::{Handler, InvocationError, Registry, RegistryError};
use crate::value::Argument;

pub const TARGET: &str = "Stevedore";

/// Upper bound for `Stevedore.sleep`.
const MAX_SLEEP_MS: i64 = 60_000;

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn invoke(&self, arguments: &[Argument]) -> Result<JsonValue, InvocationError> {
        Ok(JsonValue::Array(arguments.iter().map(Argument::to_json).collect()))
    }
}

struct Sleep;

#[async_trait]
impl Handler for Sleep {
    async fn invoke(&self, arguments: &[Argument]) -> Result<JsonValue, InvocationError> {
        let millis = arguments
            .first()
            .and_then(Argument::as_i64)
            .ok_or_else(|| InvocationError::bad_argument(0, "int", arguments.first()))?;
        if !(0..=MAX_SLEEP_MS).contains(&millis) {
            return Err(InvocationError::new(format!(
                "sleep duration must be between 0 and {MAX_SLEEP_MS} ms, got {millis}"
            )));
        }

        tokio::time::sleep(Duration::from_millis(millis as u64)).await;
        Ok(json!({ "slept_ms": millis }))
    }
}

/// Register the built-in `Stevedore` target.
pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(TARGET, "echo", Arc::new(Echo))?;
    registry.register(TARGET, "sleep", Arc::new(Sleep))?;
    Ok(())
}
