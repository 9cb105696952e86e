//! Push handler - judges incoming changes one by one.

use pocket_engine::{
    AcceptedChange, ChangeRecord, ErrorCode, PushAckPayload, PushPayload, RejectedChange,
    RemoteApply,
};

use super::sessions::ServerSession;
use super::ServerState;

/// Validate and apply every change of a push batch.
///
/// Records are independent: one rejection never affects the others. A
/// change that was already accepted is acknowledged again without being
/// reapplied.
pub(crate) fn handle_push(
    state: &mut ServerState,
    session: &ServerSession,
    payload: PushPayload,
) -> PushAckPayload {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for change in payload.changes {
        match judge(state, session, &change) {
            Ok(()) => accepted.push(AcceptedChange {
                collection: change.collection,
                document_id: change.document_id,
                seq: change.seq,
            }),
            Err((code, reason)) => {
                let server_version = match code {
                    ErrorCode::Conflict => state.latest_version(&change).cloned(),
                    _ => None,
                };
                rejected.push(RejectedChange {
                    collection: change.collection,
                    document_id: change.document_id,
                    seq: change.seq,
                    code,
                    reason,
                    server_version,
                });
            }
        }
    }

    tracing::debug!(
        session_id = %session.id,
        node_id = %session.node_id,
        accepted = accepted.len(),
        rejected = rejected.len(),
        "push processed"
    );

    PushAckPayload {
        accepted,
        rejected,
        checkpoint: state.checkpoint(),
    }
}

fn judge(
    state: &mut ServerState,
    session: &ServerSession,
    change: &ChangeRecord,
) -> Result<(), (ErrorCode, String)> {
    let key = change.acceptance_key();
    if state.accepted.contains(&key) {
        return Ok(());
    }

    change
        .validate()
        .map_err(|e| (ErrorCode::InvalidMessage, e.to_string()))?;

    if !session.serves(&change.collection) {
        return Err((
            ErrorCode::CollectionNotFound,
            format!("collection '{}' is not part of this session", change.collection),
        ));
    }

    if change.node_id != session.node_id {
        tracing::warn!(
            expected = %session.node_id,
            received = %change.node_id,
            "Node ID mismatch in pushed change"
        );
    }

    match state.replica.apply_remote(change) {
        RemoteApply::Applied => {
            state.record(key, change.clone());
            Ok(())
        }
        RemoteApply::Ignored => Err((
            ErrorCode::Conflict,
            "a newer version of the document exists".to_string(),
        )),
    }
}
