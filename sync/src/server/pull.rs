//! Pull handler - serves pages of the change log.

use pocket_engine::{decode_checkpoint, encode_checkpoint, PullPayload, PullResponsePayload};

use super::sessions::ServerSession;
use super::ServerState;
use crate::config::ServerConfig;

/// Serve one page of changes after the request's checkpoint.
///
/// The requesting node's own changes and collections outside the session
/// are skipped. The returned checkpoint is exactly what the next request
/// should send.
pub(crate) fn handle_pull(
    state: &ServerState,
    session: &ServerSession,
    config: &ServerConfig,
    payload: &PullPayload,
) -> PullResponsePayload {
    let from = decode_checkpoint(payload.checkpoint.as_deref());
    let limit = config.pull_limit(payload.limit);
    let requested = payload.collections.as_deref();

    let page = state.log.since_where(from, limit, |change| {
        change.node_id != session.node_id
            && session.serves(&change.collection)
            && requested.map_or(true, |r| r.contains(&change.collection))
    });

    tracing::debug!(
        session_id = %session.id,
        from,
        returned = page.changes.len(),
        next = page.next,
        has_more = page.has_more,
        "pull served"
    );

    PullResponsePayload {
        changes: page.changes,
        checkpoint: encode_checkpoint(page.next),
        has_more: page.has_more,
    }
}
