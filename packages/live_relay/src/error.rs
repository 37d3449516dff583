use std::time::Duration;

use crate::release::DecodeError;

/// Errors surfaced by the relay core.
///
/// Only start-time failures reach a caller; anything that happens after a
/// listener is running is logged by the listener and ends in its own
/// termination instead.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("kind {kind} is not served by {group_version}")]
    KindNotFound { group_version: String, kind: String },

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A stream could not be opened, or an item could not be read from it.
    #[error("stream error: {0}")]
    Stream(String),

    /// Any other failure reported by the cluster API.
    #[error("cluster api error: {0}")]
    Api(String),

    #[error("broadcast hub is shut down")]
    HubClosed,

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to decode release record: {0}")]
    Decode(#[from] DecodeError),
}

impl RelayError {
    pub fn stream(message: impl std::fmt::Display) -> Self {
        RelayError::Stream(message.to_string())
    }

    pub fn api(message: impl std::fmt::Display) -> Self {
        RelayError::Api(message.to_string())
    }
}

/// Run `fut` under `limit`, mapping expiry to [`RelayError::Timeout`].
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, RelayError>
where
    F: std::future::Future<Output = Result<T, RelayError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout {
            operation,
            after: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_includes_operation() {
        let err = RelayError::Timeout {
            operation: "open watch",
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "open watch timed out after 30s");
    }

    #[test]
    fn kind_not_found_message() {
        let err = RelayError::KindNotFound {
            group_version: "apps/v1".into(),
            kind: "Widget".into(),
        };
        assert_eq!(err.to_string(), "kind Widget is not served by apps/v1");
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_maps_expiry() {
        let result: Result<(), RelayError> = bounded(
            "open logs",
            Duration::from_millis(50),
            std::future::pending(),
        )
        .await;
        assert!(matches!(
            result,
            Err(RelayError::Timeout {
                operation: "open logs",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn bounded_passes_through() {
        let result = bounded("noop", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
