// # State Changer Trait
//
// Defines the host primitive that enables, disables or tests an endpoint.
//
// The provider never trusts this primitive's own success signal: after it
// returns, the state-change engine re-scans the host and only completes a
// job once the repository shows the requested status.

use async_trait::async_trait;

use crate::model::{AdminStatus, EndpointKey};

/// Trait for host state-change implementations
///
/// # Trust Level: Untrusted
///
/// ## Allowed Capabilities
/// - ✅ Issue exactly one host operation per call
/// - ✅ Return success or failure (the engine decides what happens next)
///
/// ## Forbidden Capabilities
/// - ❌ Retry or poll for convergence (owned by `StateChangeEngine`)
/// - ❌ Access the instance repository
/// - ❌ Spawn tasks that outlive the call
///
/// # Abort
///
/// When [`supports_abort()`](StateChanger::supports_abort) returns `true`,
/// dropping the future returned by `apply_state` MUST abort the host
/// operation. Otherwise the engine lets an abandoned operation run to
/// completion and discards its result.
#[async_trait]
pub trait StateChanger: Send + Sync {
    /// Drive the endpoint towards `target`
    ///
    /// # Returns
    ///
    /// - `Ok(())`: the host accepted the operation (not proof of convergence)
    /// - `Err(Error)`: the host operation failed
    async fn apply_state(&self, key: &EndpointKey, target: AdminStatus) -> Result<(), crate::Error>;

    /// Whether dropping an in-flight `apply_state` aborts it
    fn supports_abort(&self) -> bool {
        false
    }

    /// Get the changer name (for logging/debugging)
    fn changer_name(&self) -> &'static str;
}
