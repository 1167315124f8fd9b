//! [`CloudApi`] over HTTP+JSON.
//!
//! Each provider section in the config points at a gateway service that
//! wraps the vendor SDK. Routes:
//!
//! - `GET  /locations`
//! - `GET  /locations/{location}/vms/{vm}`
//! - `POST /operations` (header `Idempotency-Key`)
//! - `GET  /operations/{id}`
//! - `DELETE /resources/{kind}/{id}?location=`
//! - `POST /grants/revoke`

use super::{CloudApi, OperationHandle, OperationOutput, OperationRequest, ProviderError};
use crate::job::{AccessGrant, ProviderKind, ResourceHandle, VmDescriptor};
use crate::log_debug;
use crate::poller::OperationStatus;
use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

pub struct GatewayCloudApi {
    provider: ProviderKind,
    http: reqwest::Client,
    base_url: Url,
    credential: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartedOperation {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum GatewayState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: GatewayState,
    #[serde(default)]
    progress: Option<u8>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    output: Option<OperationOutput>,
}

impl GatewayCloudApi {
    pub fn new(
        provider: ProviderKind,
        base_url: impl Into<String>,
        credential: Option<String>,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cloudhop/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::Protocol(format!("HTTP client: {}", e)))?;

        let base_url: String = base_url.into();
        let base_url = Url::parse(&base_url)
            .map_err(|e| ProviderError::Protocol(format!("gateway URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::Protocol(format!(
                "gateway URL '{}' cannot carry a path",
                base_url
            )));
        }

        Ok(Self {
            provider,
            http,
            base_url,
            credential,
        })
    }

    /// Route under the base URL. Each segment is percent-encoded on its own,
    /// so identifiers cannot add path segments or a query.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ProviderError::Protocol(format!("gateway URL '{}' cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credential {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, ProviderError> {
        let response = self.authorize(request).send().await.map_err(transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    match err.status() {
        Some(status) => status_error(status, err.to_string()),
        None => ProviderError::Transient(err.to_string()),
    }
}

fn status_error(status: StatusCode, body: String) -> ProviderError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(detail),
        StatusCode::UNAUTHORIZED => ProviderError::AuthFailure(detail),
        StatusCode::FORBIDDEN => ProviderError::PermissionDenied(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderError::InvalidIdentifier(detail)
        }
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::Transient(detail)
        }
        _ => ProviderError::Protocol(detail),
    }
}

fn decode_status(body: StatusBody) -> OperationStatus<OperationOutput> {
    match body.status {
        GatewayState::Pending | GatewayState::Running => OperationStatus::Pending {
            progress: body.progress,
        },
        GatewayState::Succeeded => OperationStatus::Succeeded(body.output.unwrap_or_default()),
        GatewayState::Failed => OperationStatus::Failed {
            message: body
                .message
                .unwrap_or_else(|| "provider reported failure without a message".to_string()),
        },
    }
}

#[async_trait]
impl CloudApi for GatewayCloudApi {
    async fn list_locations(&self) -> Result<Vec<String>, ProviderError> {
        let response = self.send(self.http.get(self.endpoint(&["locations"])?)).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))
    }

    async fn describe_vm(
        &self,
        location: &str,
        vm_identifier: &str,
    ) -> Result<Option<VmDescriptor>, ProviderError> {
        let url = self.endpoint(&["locations", location, "vms", vm_identifier])?;
        match self.send(self.http.get(url)).await {
            Ok(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| ProviderError::Protocol(e.to_string())),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn start_operation(
        &self,
        request: &OperationRequest,
        idempotency_token: &str,
    ) -> Result<OperationHandle, ProviderError> {
        log_debug!("{} gateway: starting {:?}", self.provider, request);
        let response = self
            .send(
                self.http
                    .post(self.endpoint(&["operations"])?)
                    .header("Idempotency-Key", idempotency_token)
                    .json(request),
            )
            .await?;
        let started: StartedOperation = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        Ok(OperationHandle {
            id: started.id,
            provider: self.provider,
        })
    }

    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus<OperationOutput>, ProviderError> {
        let url = self.endpoint(&["operations", handle.id.as_str()])?;
        let response = self.send(self.http.get(url)).await?;
        let body: StatusBody = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        Ok(decode_status(body))
    }

    async fn delete_resource(&self, resource: &ResourceHandle) -> Result<(), ProviderError> {
        let kind = serde_json::to_value(resource.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "resource".to_string());
        let mut request = self
            .http
            .delete(self.endpoint(&["resources", kind.as_str(), resource.id.as_str()])?);
        if let Some(location) = &resource.location {
            request = request.query(&[("location", location)]);
        }
        self.send(request).await?;
        Ok(())
    }

    async fn revoke_access(&self, grant: &AccessGrant) -> Result<(), ProviderError> {
        self.send(self.http.post(self.endpoint(&["grants", "revoke"])?).json(grant))
            .await?;
        Ok(())
    }
}
