use axum::{Json, extract::State, extract::rejection::JsonRejection};
use live_relay::RelayError;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::AppState;
use crate::error::{ApiError, require};

#[derive(Debug, Deserialize)]
pub struct ReleasesBody {
    #[serde(default)]
    pub server: Option<String>,
    /// Namespaces to list; none yields no charts.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Latest revision of every release, and start the cluster's release cache
/// so later changes are pushed to clients.
pub async fn list_helm_releases(
    State(state): State<AppState>,
    payload: Result<Json<ReleasesBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let server = require(body.server.as_deref(), "server")?;

    match state.releases.ensure_cache(server).await {
        Ok(_) => {}
        Err(err @ RelayError::UnknownCluster(_)) => return Err(err.into()),
        // Listing still works without live updates.
        Err(err) => warn!(cluster = server, error = %err, "release cache not started"),
    }

    let namespaces: Vec<String> = body
        .namespaces
        .into_iter()
        .filter(|ns| !ns.trim().is_empty())
        .collect();
    let charts = state.releases.list_releases(server, &namespaces).await?;
    Ok(Json(json!({ "charts": charts })))
}

/// Latest revision of one release.
pub async fn get_helm_release(
    State(state): State<AppState>,
    payload: Result<Json<ReleaseBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let server = require(body.server.as_deref(), "server")?;
    let namespace = require(body.namespace.as_deref(), "namespace")?;
    let name = require(body.name.as_deref(), "name")?;

    match state.releases.get_release(server, namespace, name).await? {
        Some(release) => Ok(Json(json!({ "data": release }))),
        None => Err(ApiError::NotFound(format!("release {namespace}/{name} not found"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{post_json, test_app_state};
    use axum::{Router, http::StatusCode, routing::post};
    use live_relay::cluster::{ReleaseNotification, StoredRelease};
    use live_relay::envelope::ReleaseAction;
    use live_relay::testing::{FakeCluster, release_record};
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_router(state: AppState) -> Router {
        Router::new()
            .route("/releases", post(list_helm_releases))
            .route("/release", post(get_helm_release))
            .with_state(state)
    }

    fn stored(namespace: &str, secret: &str, release: Value) -> StoredRelease {
        StoredRelease {
            namespace: namespace.into(),
            name: secret.into(),
            record: release_record(&release),
        }
    }

    async fn seeded() -> FakeCluster {
        let fake = FakeCluster::new(["prod"]);
        fake.store_release(stored("web", "sh.helm.release.v1.site.v1", json!({"name": "site", "namespace": "web", "version": 1})))
            .await;
        fake.store_release(stored("web", "sh.helm.release.v1.site.v2", json!({"name": "site", "namespace": "web", "version": 2, "info": {"status": "deployed"}})))
            .await;
        fake.store_release(stored("data", "sh.helm.release.v1.pg.v7", json!({"name": "pg", "namespace": "data", "version": 7})))
            .await;
        fake
    }

    #[tokio::test]
    async fn test_list_returns_latest_revisions_and_starts_cache() {
        let fake = seeded().await;
        let (state, _shutdown) = test_app_state(fake.clone());

        let (status, body) = post_json(
            test_router(state.clone()),
            "/releases",
            json!({"server": "prod", "namespaces": ["web"]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let charts = body["charts"].as_array().unwrap();
        assert_eq!(charts.len(), 1);
        assert_eq!(charts[0]["name"], "site");
        assert_eq!(charts[0]["version"], 2);
        assert_eq!(charts[0]["info"]["status"], "deployed");

        assert_eq!(fake.release_opens().await, vec!["prod".to_string()]);
        assert_eq!(state.releases.active_caches().await, vec!["prod".to_string()]);
    }

    #[tokio::test]
    async fn test_list_spans_requested_namespaces_only() {
        let fake = seeded().await;
        let (state, _shutdown) = test_app_state(fake.clone());
        let app = test_router(state);

        let (status, body) = post_json(
            app.clone(),
            "/releases",
            json!({"server": "prod", "namespaces": ["web", "data", " "]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["charts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["pg", "site"]);

        let (status, body) =
            post_json(app, "/releases", json!({"server": "prod", "namespaces": []})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["charts"], json!([]));
        // The cache still starts for live updates.
        assert_eq!(fake.release_opens().await, vec!["prod".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_pushes_changes_after_listing() {
        let fake = seeded().await;
        let (state, _shutdown) = test_app_state(fake.clone());
        let mut sub = state.hub.register().await.unwrap();
        post_json(test_router(state), "/releases", json!({"server": "prod"})).await;

        let sender = fake.release_sender("prod").await.unwrap();
        sender
            .send(Ok(ReleaseNotification {
                action: ReleaseAction::Updated,
                namespace: "web".into(),
                name: "sh.helm.release.v1.site.v3".into(),
                record: release_record(&json!({"name": "site", "namespace": "web", "version": 3})),
            }))
            .unwrap();

        let frame = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["event"], "helm-release-prod-updated");
        assert_eq!(frame["payload"]["version"], 3);
    }

    #[tokio::test]
    async fn test_list_survives_cache_failure() {
        let fake = seeded().await;
        let (state, _shutdown) = test_app_state(fake.clone());
        fake.fail_opens(Some("forbidden")).await;

        let (status, body) = post_json(
            test_router(state.clone()),
            "/releases",
            json!({"server": "prod", "namespaces": ["web"]}),
        )
        .await;
        // A namespace that cannot be listed is skipped as well.
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["charts"], json!([]));
        assert!(state.releases.active_caches().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_unknown_cluster_is_400() {
        let (state, _shutdown) = test_app_state(seeded().await);
        let (status, body) =
            post_json(test_router(state), "/releases", json!({"server": "nowhere"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "unknown cluster: nowhere");
    }

    #[tokio::test]
    async fn test_get_release() {
        let (state, _shutdown) = test_app_state(seeded().await);
        let app = test_router(state);

        let (status, body) = post_json(
            app.clone(),
            "/release",
            json!({"server": "prod", "namespace": "data", "name": "pg"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["version"], 7);

        let (status, body) = post_json(
            app,
            "/release",
            json!({"server": "prod", "namespace": "data", "name": "redis"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "release data/redis not found");
    }
}
