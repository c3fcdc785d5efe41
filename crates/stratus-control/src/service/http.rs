//! HTTP client for a REST control plane.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::{
    ClusterDescription, ClusterId, ClusterSpec, StepIndex, StepKey, StepMetadata, StepSpec,
    StepStatus,
};

use super::{ControlService, StepMetadataStore};

#[derive(Deserialize)]
struct CreatedCluster {
    id: ClusterId,
}

#[derive(Deserialize)]
struct ClusterList {
    clusters: Vec<ClusterId>,
}

#[derive(Deserialize)]
struct AddedStep {
    index: StepIndex,
}

#[derive(Deserialize)]
struct StepState {
    status: StepStatus,
}

/// Control plane client speaking JSON over HTTP.
///
/// Also serves as the step metadata store, reading from `metadata_url` when
/// configured and from the control plane otherwise.
#[derive(Debug, Clone)]
pub struct HttpControlService {
    client: Client,
    base_url: String,
    metadata_url: String,
}

impl HttpControlService {
    /// Create a client from configuration.
    pub fn new(config: &ControlConfig) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ControlError::Http)?;

        let base_url = config.url.trim_end_matches('/').to_owned();
        let metadata_url = config
            .metadata_url
            .as_deref()
            .map_or_else(|| base_url.clone(), |u| u.trim_end_matches('/').to_owned());

        Ok(Self {
            client,
            base_url,
            metadata_url,
        })
    }

    /// Base URL of the control plane.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn cluster_url(&self, id: &ClusterId) -> String {
        format!("{}/clusters/{}", self.base_url, id)
    }
}

/// Route a non-success response came from.
#[derive(Debug, Clone, Copy)]
enum Route<'a> {
    Create { name: &'a str },
    List,
    Cluster {
        operation: &'static str,
        id: &'a ClusterId,
    },
    Metadata,
}

impl<'a> Route<'a> {
    const fn cluster(operation: &'static str, id: &'a ClusterId) -> Self {
        Self::Cluster { operation, id }
    }

    const fn operation(self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::List => "list_by_name",
            Self::Cluster { operation, .. } => operation,
            Self::Metadata => "metadata",
        }
    }
}

/// Classify a non-success status into the error callers match on.
fn status_error(route: Route<'_>, status: StatusCode, body: &str) -> ControlError {
    let operation = route.operation();
    match (route, status) {
        (_, StatusCode::TOO_MANY_REQUESTS) => ControlError::throttled(operation),
        (Route::Create { name }, StatusCode::CONFLICT) => ControlError::NameCollision {
            name: name.to_owned(),
        },
        (Route::Cluster { id, .. }, StatusCode::NOT_FOUND) => {
            ControlError::ClusterNotFound(id.to_string())
        }
        _ if body.is_empty() => ControlError::service(format!("{operation} failed: {status}")),
        _ => ControlError::service(format!("{operation} failed: {status}: {body}")),
    }
}

async fn reject(route: Route<'_>, response: Response) -> ControlError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    status_error(route, status, &body)
}

#[async_trait]
impl ControlService for HttpControlService {
    async fn create(&self, spec: &ClusterSpec) -> ControlResult<ClusterId> {
        let url = format!("{}/clusters", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(spec)
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let created: CreatedCluster = response.json().await.map_err(ControlError::Http)?;
                Ok(created.id)
            }
            _ => Err(reject(Route::Create { name: &spec.name }, response).await),
        }
    }

    async fn describe(&self, id: &ClusterId) -> ControlResult<ClusterDescription> {
        let response = self
            .client
            .get(self.cluster_url(id))
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::OK => response.json().await.map_err(ControlError::Http),
            _ => Err(reject(Route::cluster("describe", id), response).await),
        }
    }

    async fn list_by_name(&self, name: &str) -> ControlResult<Vec<ClusterId>> {
        let url = format!("{}/clusters", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("name", name)])
            .send()
            .await
            .map_err(ControlError::Http)?;

        if !response.status().is_success() {
            return Err(reject(Route::List, response).await);
        }
        let list: ClusterList = response.json().await.map_err(ControlError::Http)?;
        Ok(list.clusters)
    }

    async fn add_step(&self, id: &ClusterId, spec: &StepSpec) -> ControlResult<StepIndex> {
        let url = format!("{}/steps", self.cluster_url(id));
        let response = self
            .client
            .post(&url)
            .json(spec)
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let added: AddedStep = response.json().await.map_err(ControlError::Http)?;
                Ok(added.index)
            }
            _ => Err(reject(Route::cluster("add_step", id), response).await),
        }
    }

    async fn describe_step(&self, id: &ClusterId, index: StepIndex) -> ControlResult<StepStatus> {
        let url = format!("{}/steps/{}", self.cluster_url(id), index);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::OK => {
                let state: StepState = response.json().await.map_err(ControlError::Http)?;
                Ok(state.status)
            }
            _ => Err(reject(Route::cluster("describe_step", id), response).await),
        }
    }

    async fn terminate(&self, id: &ClusterId) -> ControlResult<()> {
        let response = self
            .client
            .delete(self.cluster_url(id))
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(reject(Route::cluster("terminate", id), response).await),
        }
    }
}

#[async_trait]
impl StepMetadataStore for HttpControlService {
    async fn get(&self, key: &StepKey) -> ControlResult<StepMetadata> {
        let url = format!(
            "{}/clusters/{}/steps/{}/metadata",
            self.metadata_url, key.cluster, key.index
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::OK => response.json().await.map_err(ControlError::Http),
            StatusCode::NOT_FOUND => Ok(StepMetadata::new()),
            _ => Err(reject(Route::Metadata, response).await),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn client_creation() {
        let service = HttpControlService::new(&ControlConfig::default());
        assert!(service.is_ok());
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let config = ControlConfig {
            url: "https://control.example.com/".to_owned(),
            ..ControlConfig::default()
        };
        let service = HttpControlService::new(&config).unwrap();
        assert_eq!(service.base_url(), "https://control.example.com");
        assert_eq!(
            service.cluster_url(&ClusterId::new("c-1")),
            "https://control.example.com/clusters/c-1"
        );
    }

    #[test]
    fn metadata_url_defaults_to_control_url() {
        let service = HttpControlService::new(&ControlConfig::default()).unwrap();
        assert_eq!(service.metadata_url, service.base_url);

        let config = ControlConfig {
            metadata_url: Some("http://metadata:9000/".to_owned()),
            ..ControlConfig::default()
        };
        let service = HttpControlService::new(&config).unwrap();
        assert_eq!(service.metadata_url, "http://metadata:9000");
    }

    #[test]
    fn wire_payloads_parse() {
        let list: ClusterList = serde_json::from_str(r#"{"clusters":["c-1","c-2"]}"#).unwrap();
        assert_eq!(list.clusters, vec![ClusterId::new("c-1"), ClusterId::new("c-2")]);

        let step: StepState = serde_json::from_str(r#"{"status":"running"}"#).unwrap();
        assert_eq!(step.status, StepStatus::Running);

        let description: ClusterDescription = serde_json::from_str(
            r#"{"id":"c-1","name":"etl","state":"ready","created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(description.address.is_none());
    }

    #[rstest]
    #[case::create(Route::Create { name: "etl" })]
    #[case::list(Route::List)]
    #[case::metadata(Route::Metadata)]
    fn too_many_requests_is_throttling(#[case] route: Route<'static>) {
        let err = status_error(route, StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(
            matches!(&err, ControlError::Throttled { operation } if operation == route.operation())
        );
    }

    #[test]
    fn too_many_requests_on_cluster_route_is_throttling() {
        let id = ClusterId::new("c-1");
        let err = status_error(Route::cluster("describe", &id), StatusCode::TOO_MANY_REQUESTS, "");
        assert!(err.is_throttling());
    }

    #[test]
    fn conflict_on_create_is_name_collision() {
        let err = status_error(Route::Create { name: "etl" }, StatusCode::CONFLICT, "");
        assert!(matches!(err, ControlError::NameCollision { name } if name == "etl"));
    }

    #[test]
    fn conflict_elsewhere_is_a_service_error() {
        let id = ClusterId::new("c-1");
        let err = status_error(Route::cluster("describe", &id), StatusCode::CONFLICT, "busy");
        assert!(matches!(err, ControlError::Service(m) if m == "describe failed: 409 Conflict: busy"));
    }

    #[rstest]
    #[case("describe")]
    #[case("add_step")]
    #[case("describe_step")]
    #[case("terminate")]
    fn not_found_on_cluster_routes(#[case] operation: &'static str) {
        let id = ClusterId::new("c-9");
        let err = status_error(Route::cluster(operation, &id), StatusCode::NOT_FOUND, "");
        assert!(matches!(err, ControlError::ClusterNotFound(found) if found == "c-9"));
    }

    #[test]
    fn not_found_on_list_is_a_service_error() {
        let err = status_error(Route::List, StatusCode::NOT_FOUND, "");
        assert!(matches!(err, ControlError::Service(m) if m == "list_by_name failed: 404 Not Found"));
    }

    #[rstest]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, "", "create failed: 500 Internal Server Error")]
    #[case(StatusCode::BAD_REQUEST, "bad name", "create failed: 400 Bad Request: bad name")]
    #[case(StatusCode::SERVICE_UNAVAILABLE, "", "create failed: 503 Service Unavailable")]
    fn other_statuses_carry_status_and_body(
        #[case] status: StatusCode,
        #[case] body: &str,
        #[case] expected: &str,
    ) {
        let err = status_error(Route::Create { name: "etl" }, status, body);
        assert!(matches!(&err, ControlError::Service(m) if m == expected));
        assert!(!err.is_throttling());
    }
}
