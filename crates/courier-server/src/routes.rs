//! Thin HTTP collaborators around the engine.
//!
//! These routes carry no delivery logic of their own: submissions go
//! through the engine like any socket submission, and every group
//! mutation propagates into subscription state so live sessions of the
//! affected members start or stop receiving the group's traffic without
//! reconnecting.

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use courier_core::{ConversationKey, EngineError, MembershipError, Submission};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Build the HTTP API router.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/send", post(send_direct))
        .route("/api/messages", get(direct_history))
        .route("/api/groups", post(create_group).get(list_groups))
        .route("/api/groups/:id", delete(delete_group))
        .route("/api/groups/:id/message", post(send_group_message))
        .route("/api/groups/:id/messages", get(group_history))
        .route("/api/groups/:id/members", post(add_member))
        .route("/api/groups/:id/members/:user", delete(remove_member))
}

/// Health check handler.
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    from: String,
    to: String,
    message: String,
}

/// POST /api/send - submit a direct message.
async fn send_direct(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendBody>,
) -> (StatusCode, Json<Value>) {
    match state
        .engine
        .submit_direct(&body.from, &body.to, &body.message)
        .await
    {
        Ok(submission) => committed(submission),
        Err(e) => engine_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct DirectHistoryQuery {
    u1: String,
    u2: String,
    since: Option<u64>,
}

/// GET /api/messages?u1=alice&u2=bob - direct history, symmetric in its
/// arguments.
async fn direct_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectHistoryQuery>,
) -> (StatusCode, Json<Value>) {
    let key = ConversationKey::direct(query.u1, query.u2);
    match state.engine.history(&key, query.since).await {
        Ok(messages) => (StatusCode::OK, Json(json!(messages))),
        Err(e) => engine_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateGroupBody {
    name: String,
    members: Vec<String>,
    #[serde(default, alias = "createdBy")]
    created_by: Option<String>,
}

/// POST /api/groups - create a group and subscribe its members' live
/// sessions to the new topic.
async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateGroupBody>,
) -> (StatusCode, Json<Value>) {
    let group = match state
        .membership
        .create_group(&body.name, body.created_by, &body.members)
    {
        Ok(group) => group,
        Err(e) => return membership_error(&e),
    };

    for member in &group.members {
        for connection_id in state.engine.connections_on(member) {
            state.engine.join(&group.id, &connection_id).await;
        }
    }

    (StatusCode::CREATED, Json(json!({ "ok": true, "group": group })))
}

#[derive(Debug, Deserialize)]
struct ListGroupsQuery {
    member: Option<String>,
}

/// GET /api/groups?member=alice - list groups, newest first.
async fn list_groups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListGroupsQuery>,
) -> Json<Value> {
    let groups = state.membership.list_groups(query.member.as_deref());
    Json(json!(groups))
}

/// DELETE /api/groups/:id - delete a group and drop its topic so no
/// former subscriber receives anything stale.
async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.membership.delete_group(&id) {
        Ok(_) => {
            state.engine.drop_topic(&id);
            debug!(group = %id, "Group topic dropped");
            (StatusCode::OK, Json(json!({ "ok": true })))
        }
        Err(e) => membership_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct GroupMessageBody {
    from: String,
    text: String,
}

/// POST /api/groups/:id/message - submit a group message.
async fn send_group_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<GroupMessageBody>,
) -> (StatusCode, Json<Value>) {
    match state.engine.submit_group(&id, &body.from, &body.text).await {
        Ok(submission) => committed(submission),
        Err(e) => engine_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct GroupHistoryQuery {
    since: Option<u64>,
}

/// GET /api/groups/:id/messages - group history, ascending.
async fn group_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<GroupHistoryQuery>,
) -> (StatusCode, Json<Value>) {
    let key = ConversationKey::group(id);
    match state.engine.history(&key, query.since).await {
        Ok(messages) => (StatusCode::OK, Json(json!(messages))),
        Err(e) => engine_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct AddMemberBody {
    user: String,
}

/// POST /api/groups/:id/members - add a member and subscribe their live
/// sessions to the group topic.
async fn add_member(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AddMemberBody>,
) -> (StatusCode, Json<Value>) {
    match state.membership.add_member(&id, &body.user) {
        Ok(added) => {
            if added {
                for connection_id in state.engine.connections_on(&body.user) {
                    state.engine.join(&id, &connection_id).await;
                }
            }
            (StatusCode::OK, Json(json!({ "ok": true, "added": added })))
        }
        Err(e) => membership_error(&e),
    }
}

/// DELETE /api/groups/:id/members/:user - remove a member and unsubscribe
/// their live sessions from the group topic.
async fn remove_member(
    State(state): State<Arc<AppState>>,
    Path((id, user)): Path<(String, String)>,
) -> (StatusCode, Json<Value>) {
    match state.membership.remove_member(&id, &user) {
        Ok(removed) => {
            if removed {
                for connection_id in state.engine.connections_on(&user) {
                    state.engine.leave(&id, &connection_id);
                }
            }
            (StatusCode::OK, Json(json!({ "ok": true, "removed": removed })))
        }
        Err(e) => membership_error(&e),
    }
}

/// 201 response carrying the committed record; delivery counts are
/// observational.
fn committed(submission: Submission) -> (StatusCode, Json<Value>) {
    let kind = if submission.message.is_direct() {
        "direct"
    } else {
        "group"
    };
    metrics::record_submission(
        kind,
        submission.delivered_to.len(),
        submission.failed_deliveries,
    );

    (
        StatusCode::CREATED,
        Json(json!({
            "ok": true,
            "msg": submission.message,
            "delivered_to": submission.delivered_to,
        })),
    )
}

fn engine_error(e: &EngineError) -> (StatusCode, Json<Value>) {
    let status = match e {
        EngineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        EngineError::GroupNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Store(_) => {
            metrics::record_error("store");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "ok": false, "message": e.to_string() })))
}

fn membership_error(e: &MembershipError) -> (StatusCode, Json<Value>) {
    let status = match e {
        MembershipError::NotFound(_) => StatusCode::NOT_FOUND,
        MembershipError::Invalid(_) => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({ "ok": false, "message": e.to_string() })))
}
