use std::collections::HashMap;

use axum::http::StatusCode;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use crate::directory::DirectoryError;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .route("/nodes/register", post(register_node))
        .route("/nodes/unregister", post(unregister_node))
        .route("/route", get(route_user))
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
    }))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

// --- Register / unregister ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    instance_id: Option<String>,
    #[serde(default = "default_weight")]
    weight: u32,
}

fn default_weight() -> u32 {
    1
}

async fn register_node(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Response {
    let Some(instance_id) = body.instance_id.filter(|id| !id.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "instanceId is required");
    };

    match assign_vnodes(&state, &instance_id, body.weight).await {
        Ok(assigned) if assigned.is_empty() => {
            tracing::warn!(instance_id = %instance_id, "register rejected: ring is full");
            error_response(StatusCode::CONFLICT, "no vnodes available")
        }
        Ok(assigned) => {
            tracing::info!(
                instance_id = %instance_id,
                weight = body.weight,
                vnodes = assigned.len(),
                "instance registered"
            );
            (
                StatusCode::CREATED,
                Json(json!({ "instanceId": instance_id, "assignedVnodes": assigned })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, instance_id = %instance_id, "register failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "directory unavailable")
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnregisterRequest {
    instance_id: Option<String>,
}

async fn unregister_node(
    State(state): State<AppState>,
    Json(body): Json<UnregisterRequest>,
) -> Response {
    let Some(instance_id) = body.instance_id.filter(|id| !id.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "instanceId is required");
    };

    match remove_instance(&state, &instance_id).await {
        Ok(removed) if removed.is_empty() => {
            error_response(StatusCode::NOT_FOUND, "no vnodes assigned to instance")
        }
        Ok(removed) => {
            tracing::info!(instance_id = %instance_id, vnodes = removed.len(), "instance unregistered");
            Json(json!({ "instanceId": instance_id, "removedVnodes": removed })).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, instance_id = %instance_id, "unregister failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "directory unavailable")
        }
    }
}

/// Assign free vnodes to an instance.
///
/// `weight` is percentage points of the ring: `desired = max(1, V × weight
/// / 100)`. The scan takes the lowest free ids; fewer than `desired`
/// available is still a successful (partial) registration, zero available is
/// the conflict surfaced by the handler. Not transactional against
/// concurrent registrations: run one coordinator replica.
pub(crate) async fn assign_vnodes(
    state: &AppState,
    instance_id: &str,
    weight: u32,
) -> Result<Vec<u32>, DirectoryError> {
    let occupied = state.directory.get_owners().await?;
    state.ring.update_mappings(&occupied);

    let vnode_count = state.ring.vnode_count();
    let desired = ((u64::from(vnode_count) * u64::from(weight)) / 100).max(1) as usize;

    let mut chosen = Vec::with_capacity(desired);
    for vnode in 0..vnode_count {
        if chosen.len() == desired {
            break;
        }
        if !occupied.contains_key(&vnode) {
            chosen.push(vnode);
        }
    }
    if chosen.is_empty() {
        return Ok(chosen);
    }

    let mappings: HashMap<u32, String> = chosen
        .iter()
        .map(|&vnode| (vnode, instance_id.to_string()))
        .collect();
    state.directory.put_owners(&mappings, state.own_ttl).await?;
    state.ring.update_mappings(&mappings);

    Ok(chosen)
}

/// Remove every vnode owned by an instance from the directory and the local
/// ring. Returns the removed ids, sorted.
pub(crate) async fn remove_instance(
    state: &AppState,
    instance_id: &str,
) -> Result<Vec<u32>, DirectoryError> {
    let owners = state.directory.get_owners().await?;
    let mut owned: Vec<u32> = owners
        .iter()
        .filter(|(_, owner)| owner.as_str() == instance_id)
        .map(|(vnode, _)| *vnode)
        .collect();
    owned.sort_unstable();

    if owned.is_empty() {
        return Ok(owned);
    }

    state.directory.delete_owners(&owned).await?;
    state.ring.remove_vnodes(&owned);
    Ok(owned)
}

// --- Routing ---

#[derive(Deserialize)]
struct RouteQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RouteResult {
    Cached { instance: String },
    Hashed { vnode: u32, instance: String },
    Unassigned { vnode: u32 },
}

async fn route_user(State(state): State<AppState>, Query(query): Query<RouteQuery>) -> Response {
    let Some(user_id) = query.user_id.filter(|u| !u.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "userId is required");
    };

    match resolve_route(&state, &user_id).await {
        Ok(RouteResult::Cached { instance }) => Json(json!({
            "userId": user_id,
            "instance": instance,
            "source": "cache",
        }))
        .into_response(),
        Ok(RouteResult::Hashed { vnode, instance }) => Json(json!({
            "userId": user_id,
            "vnode": vnode,
            "instance": instance,
            "source": "hash",
        }))
        .into_response(),
        Ok(RouteResult::Unassigned { vnode }) => {
            tracing::debug!(user_id = %user_id, vnode, "route miss: vnode has no owner");
            error_response(StatusCode::NOT_FOUND, "no instance owns this user")
        }
        Err(e) => {
            tracing::error!(error = %e, user_id = %user_id, "route failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "directory unavailable")
        }
    }
}

/// Resolve the instance for a user: user→instance cache first, then the hash
/// ring, refreshing the local replica from the directory once on a miss.
pub(crate) async fn resolve_route(
    state: &AppState,
    user_id: &str,
) -> Result<RouteResult, DirectoryError> {
    if let Some(instance) = state.directory.get_user_instance(user_id).await? {
        return Ok(RouteResult::Cached { instance });
    }

    let vnode = state.ring.vnode_for(user_id);
    let owner = match state.ring.owner_of(vnode) {
        Some(owner) => Some(owner),
        None => {
            let owners = state.directory.get_owners().await?;
            state.ring.update_mappings(&owners);
            state.ring.owner_of(vnode)
        }
    };

    match owner {
        Some(instance) => {
            if let Err(e) = state
                .directory
                .put_user_instance(user_id, &instance, state.user_cache_ttl)
                .await
            {
                tracing::warn!(error = %e, user_id = %user_id, "failed to cache route");
            }
            Ok(RouteResult::Hashed { vnode, instance })
        }
        None => Ok(RouteResult::Unassigned { vnode }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::directory::{Directory, MemoryDirectory};
    use crate::ring::{HashRing, user_vnode};

    fn test_state(vnode_count: u32) -> AppState {
        AppState {
            directory: Arc::new(MemoryDirectory::new()),
            ring: Arc::new(HashRing::new(vnode_count)),
            own_ttl: Duration::from_secs(60),
            user_cache_ttl: Duration::from_secs(60),
        }
    }

    /// First user id (by scan) whose vnode satisfies the predicate.
    fn find_user(vnode_count: u32, accept: impl Fn(u32) -> bool) -> String {
        for i in 0..100_000 {
            let user_id = format!("user-{i}");
            if accept(user_vnode(&user_id, vnode_count)) {
                return user_id;
            }
        }
        panic!("no user found for predicate");
    }

    #[tokio::test]
    async fn test_register_cold_assigns_lowest_free_ids() {
        let state = test_state(1024);
        let assigned = assign_vnodes(&state, "A", 1).await.unwrap();
        assert_eq!(assigned, (0..10).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_register_weight_scales_share() {
        let state = test_state(1024);
        assign_vnodes(&state, "A", 1).await.unwrap();
        let assigned = assign_vnodes(&state, "B", 10).await.unwrap();

        // 1024 × 10 / 100 = 102 ids, starting after A's block
        assert_eq!(assigned.len(), 102);
        assert_eq!(assigned.first(), Some(&10));
        assert_eq!(assigned.last(), Some(&111));
    }

    #[tokio::test]
    async fn test_register_desired_is_at_least_one() {
        let state = test_state(50);
        let assigned = assign_vnodes(&state, "A", 1).await.unwrap();
        assert_eq!(assigned, vec![0]);
    }

    #[tokio::test]
    async fn test_register_partial_assignment() {
        let state = test_state(10);
        let first = assign_vnodes(&state, "A", 50).await.unwrap();
        assert_eq!(first.len(), 5);

        // B wants the whole ring but only half is free
        let second = assign_vnodes(&state, "B", 100).await.unwrap();
        assert_eq!(second, (5..10).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_register_conflict_when_full() {
        let state = test_state(4);
        assign_vnodes(&state, "A", 100).await.unwrap();
        let assigned = assign_vnodes(&state, "B", 1).await.unwrap();
        assert!(assigned.is_empty());
    }

    #[tokio::test]
    async fn test_ownership_stays_unique_across_churn() {
        let state = test_state(64);
        assign_vnodes(&state, "A", 25).await.unwrap();
        assign_vnodes(&state, "B", 25).await.unwrap();
        remove_instance(&state, "A").await.unwrap();
        assign_vnodes(&state, "C", 50).await.unwrap();

        let owners = state.directory.get_owners().await.unwrap();
        for (vnode, owner) in &owners {
            assert!(
                ["B", "C"].contains(&owner.as_str()),
                "vnode {} owned by gone instance {}",
                vnode,
                owner
            );
        }
        // No vnode can appear twice in a map; check totals instead
        assert_eq!(owners.len(), 16 + 32);
    }

    #[tokio::test]
    async fn test_unregister_removes_all_ownership() {
        let state = test_state(64);
        assign_vnodes(&state, "A", 25).await.unwrap();
        assign_vnodes(&state, "B", 25).await.unwrap();

        let removed = remove_instance(&state, "A").await.unwrap();
        assert_eq!(removed, (0..16).collect::<Vec<u32>>());

        let owners = state.directory.get_owners().await.unwrap();
        assert!(owners.values().all(|owner| owner == "B"));
        assert!(state.ring.owner_of(0).is_none());
    }

    #[tokio::test]
    async fn test_unregister_unknown_instance_is_empty() {
        let state = test_state(64);
        assign_vnodes(&state, "A", 25).await.unwrap();
        let removed = remove_instance(&state, "nope").await.unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn test_route_cold_is_unassigned() {
        let state = test_state(16);
        // A owns 0..4; pick a user hashing outside that block
        assign_vnodes(&state, "A", 25).await.unwrap();
        let user_id = find_user(16, |v| v >= 4);

        let result = resolve_route(&state, &user_id).await.unwrap();
        assert!(matches!(result, RouteResult::Unassigned { vnode } if vnode >= 4));
    }

    #[tokio::test]
    async fn test_route_hash_then_cache() {
        let state = test_state(16);
        assign_vnodes(&state, "A", 100).await.unwrap();
        let user_id = find_user(16, |_| true);

        let first = resolve_route(&state, &user_id).await.unwrap();
        let vnode = user_vnode(&user_id, 16);
        assert_eq!(
            first,
            RouteResult::Hashed {
                vnode,
                instance: "A".into()
            }
        );

        // The hash path populated the user→instance cache
        let second = resolve_route(&state, &user_id).await.unwrap();
        assert_eq!(second, RouteResult::Cached { instance: "A".into() });
    }

    #[tokio::test]
    async fn test_route_refreshes_ring_from_directory() {
        let state = test_state(16);
        // Ownership written by another coordinator: only the directory knows
        let all: HashMap<u32, String> = (0..16).map(|v| (v, "remote".to_string())).collect();
        state
            .directory
            .put_owners(&all, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(state.ring.is_empty());

        let user_id = find_user(16, |_| true);
        let result = resolve_route(&state, &user_id).await.unwrap();
        assert!(matches!(result, RouteResult::Hashed { instance, .. } if instance == "remote"));
        assert!(!state.ring.is_empty());
    }
}
