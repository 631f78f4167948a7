//! Unified Timeout Handling
//!
//! Every suspension point that talks to the network (generation call,
//! embedding call, vector-store query) is bounded. A timeout surfaces as
//! `RouterError::Timeout`, which the orchestrator treats exactly like a
//! backend failure.
//!
//! ## Usage
//!
//! ```ignore
//! use crate::ai::timeout::{Timeouts, with_timeout};
//!
//! let timeouts = Timeouts::default();
//! let generation = with_timeout(
//!     timeouts.request,
//!     backend.chat(system, message, model, &options),
//!     "generation request",
//! )
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::config::TimeoutConfig;
use crate::constants::network as net_constants;
use crate::types::{Result, RouterError};

/// Resolved timeouts for all network operations
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Generation call (buffered) or gap between stream fragments
    pub request: Duration,
    /// Embedding and vector store calls
    pub auxiliary: Duration,
    /// TCP connect
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(net_constants::DEFAULT_TIMEOUT_SECS),
            auxiliary: Duration::from_secs(net_constants::AUXILIARY_TIMEOUT_SECS),
            connect: Duration::from_secs(net_constants::CONNECTION_TIMEOUT_SECS),
        }
    }
}

impl From<&TimeoutConfig> for Timeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            request: Duration::from_secs(config.request_secs),
            auxiliary: Duration::from_secs(config.auxiliary_secs.max(1)),
            connect: Duration::from_secs(config.connect_secs.max(1)),
        }
    }
}

/// Execute an async operation with a timeout
///
/// Returns a timeout error if the operation doesn't complete within the specified duration.
pub async fn with_timeout<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(RouterError::timeout(operation_name, timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_from_config() {
        let config = TimeoutConfig {
            request_secs: 30,
            auxiliary_secs: 0,
            connect_secs: 5,
        };
        let timeouts = Timeouts::from(&config);
        assert_eq!(timeouts.request.as_secs(), 30);
        assert_eq!(timeouts.auxiliary.as_secs(), 1);
        assert_eq!(Timeouts::default().auxiliary.as_secs(), 5);
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(
            Duration::from_secs(1),
            async { Ok::<_, RouterError>(42) },
            "test operation",
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, RouterError>(42)
            },
            "slow operation",
        )
        .await;
        assert!(matches!(result.unwrap_err(), RouterError::Timeout { .. }));
    }
}
