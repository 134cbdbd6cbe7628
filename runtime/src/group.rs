//! Consumer group provisioning.

use crate::retry::{RetryPolicy, retry_with_predicate};
use relay_core::broker::{BrokerError, GroupStatus, StreamBroker};
use relay_core::entry::StartOffset;

/// Create `stream` (if absent) and `group` on it, positioned at `start`.
///
/// Idempotent: a group that already exists is reported as
/// [`GroupStatus::AlreadyExists`] and left untouched. Performs no reads or
/// acknowledgements.
///
/// # Errors
///
/// Any broker error other than "group already exists".
pub async fn ensure_group(
    broker: &dyn StreamBroker,
    stream: &str,
    group: &str,
    start: StartOffset,
) -> Result<GroupStatus, BrokerError> {
    match broker.create_group(stream, group, start).await {
        Ok(()) => {
            tracing::info!(stream, group, start = %start.as_arg(), "Consumer group created");
            Ok(GroupStatus::Created)
        },
        Err(BrokerError::GroupAlreadyExists { .. }) => {
            tracing::debug!(stream, group, "Consumer group already exists");
            Ok(GroupStatus::AlreadyExists)
        },
        Err(e) => Err(e),
    }
}

/// [`ensure_group`], retrying transient broker errors under `policy`.
///
/// # Errors
///
/// The first non-transient error, or the last transient one once retries are
/// exhausted.
pub async fn ensure_group_with_retry(
    broker: &dyn StreamBroker,
    stream: &str,
    group: &str,
    start: StartOffset,
    policy: &RetryPolicy,
) -> Result<GroupStatus, BrokerError> {
    retry_with_predicate(
        policy,
        || ensure_group(broker, stream, group, start),
        BrokerError::is_transient,
    )
    .await
}
