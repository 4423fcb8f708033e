//! # Resource Data Provider
//!
//! Translates generic resource operations into backend REST calls and
//! normalizes the answers into [`Record`]s. The provider keeps no state
//! between calls apart from its HTTP client and the endpoint table.

use reqwest::Method;
use serde_json::Value;

use crate::provider::error::{ProviderError, ProviderResult};
use crate::provider::record::{single_record, Record, RecordSet};
use crate::provider::resources::{ConfigType, EndpointRequest, EndpointTable, ListParams, Request, Resource};
use crate::retrieve::ky_http::ApiClient;

/// Generic list/get/update access to the dashboard backend.
#[derive(Debug)]
pub struct DataProvider {
    client: ApiClient,
    endpoints: EndpointTable,
}

impl DataProvider {
    /// Builds a provider on top of `client`, validating the endpoint table.
    pub fn new(client: ApiClient) -> ProviderResult<Self> {
        Ok(Self {
            client,
            endpoints: EndpointTable::load()?,
        })
    }

    /// Provider for the origin and retry budget in `settings`.
    #[cfg(feature = "configs")]
    pub fn from_settings(settings: &crate::configs::config_sync::SyncSettings) -> ProviderResult<Self> {
        Self::new(ApiClient::with_base(settings.origin.clone(), settings.http_max_retries))
    }

    /// The endpoint table in use.
    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// Fetches a collection.
    pub async fn list(&self, resource: Resource, params: &ListParams) -> ProviderResult<RecordSet> {
        let body = self.call(resource, &Request::List(params)).await?;
        RecordSet::from_response_keyed(body, resource.natural_key())
    }

    /// Fetches one record.
    pub async fn get(&self, resource: Resource, id: &str) -> ProviderResult<Record> {
        let body = self.call(resource, &Request::Get(id)).await?;
        single_record(body, id)
    }

    /// Fetches the records belonging to `parent_id`.
    pub async fn get_related(&self, resource: Resource, parent_id: &str) -> ProviderResult<RecordSet> {
        let body = self.call(resource, &Request::GetRelated(parent_id)).await?;
        RecordSet::from_response_keyed(body, resource.natural_key())
    }

    /// Sends `body` as the new state of record `id`.
    pub async fn update(&self, resource: Resource, id: &str, body: &Value) -> ProviderResult<Record> {
        let response = self.call(resource, &Request::Update(id, body)).await?;
        single_record(response, id)
    }

    /// Asks the backend to restart the services reading `config_type`.
    pub async fn restart_services(&self, config_type: ConfigType) -> ProviderResult<Record> {
        self.update(Resource::RestartServices, config_type.as_str(), &Value::Null)
            .await
    }

    async fn call(&self, resource: Resource, request: &Request<'_>) -> ProviderResult<Value> {
        let EndpointRequest {
            method,
            path,
            query,
            body,
        } = self.endpoints.build(resource, request)?;

        let response = self
            .client
            .request::<Value, Value>(method.clone(), &path, &query, body.as_ref())
            .await?;

        if !response.success {
            let body = response.error_body.unwrap_or_default();
            log::warn!(
                "{} {} {} failed with HTTP {}: {:.200}",
                resource,
                request.verb(),
                path,
                response.status,
                body
            );
            return Err(ProviderError::Http {
                status: response.status,
                body,
            });
        }

        if method != Method::GET {
            log::info!("{} {} {} -> {}", resource, request.verb(), path, response.status);
        }
        Ok(response.data.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::resources::Verb;

    fn offline_provider() -> DataProvider {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = ApiClient::new(&format!("http://127.0.0.1:{}/", port), 0).unwrap();
        DataProvider::new(client).unwrap()
    }

    #[tokio::test]
    async fn test_unsupported_verb_fails_before_request() {
        let provider = offline_provider();

        let err = provider.get(Resource::SystemStatus, "x").await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::NotSupported { resource: Resource::SystemStatus, verb: Verb::Get }
        ));

        let err = provider
            .update(Resource::Containers, "c1", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_supported());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let provider = offline_provider();
        let err = provider.list(Resource::Accounts, &ListParams::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)), "{err:?}");
        assert_eq!(err.status(), None);
    }
}
