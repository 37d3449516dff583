use axum::{Json, extract::State};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ClusterEntry {
    pub server: String,
}

/// Every configured cluster, by identity.
pub async fn lookup_configs(State(state): State<AppState>) -> Json<Vec<ClusterEntry>> {
    Json(
        state
            .api
            .clusters()
            .into_iter()
            .map(|server| ClusterEntry { server })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use crate::test_helpers::{get_json, test_app_state};
    use axum::http::StatusCode;
    use live_relay::testing::FakeCluster;
    use serde_json::json;

    #[tokio::test]
    async fn test_lookup_configs_lists_clusters() {
        let (state, _shutdown) = test_app_state(FakeCluster::new(["https://a:6443", "prod-eu"]));
        let (status, body) = get_json(crate::router(state), "/api/lookup_configs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{"server": "https://a:6443"}, {"server": "prod-eu"}]));
    }
}
