//! GraphQL over HTTP POST.

use reqwest::Client;
use serde::de::DeserializeOwned;
use tailview_api_types::{GraphQlRequest, GraphQlResponse};
use tracing::{debug, instrument};
use url::Url;

use super::error::InfraError;

/// Client bound to one GraphQL endpoint.
#[derive(Debug, Clone)]
pub struct GraphQlClient {
    client: Client,
    endpoint: Url,
}

impl GraphQlClient {
    pub fn new(endpoint: Url) -> Result<Self, InfraError> {
        let client = Client::builder().user_agent(Self::user_agent()).build()?;
        Ok(Self { client, endpoint })
    }

    pub fn with_client(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    pub fn user_agent() -> &'static str {
        concat!("tailview/", env!("CARGO_PKG_VERSION"))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Execute `request` and decode its `data` member.
    ///
    /// Non-2xx statuses, undecodable bodies, a non-empty `errors` array and
    /// a missing `data` member are all errors.
    #[instrument(skip(self, request), fields(endpoint = %self.endpoint))]
    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: &GraphQlRequest,
    ) -> Result<T, InfraError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            debug!(
                status = status.as_u16(),
                body = %String::from_utf8_lossy(&bytes),
                "GraphQL request rejected"
            );
            return Err(InfraError::status(status.as_u16(), self.endpoint.as_str()));
        }

        let envelope: GraphQlResponse<T> = serde_json::from_slice(&bytes)
            .map_err(|err| InfraError::decode(format!("failed to parse response: {err}")))?;

        if let Some(errors) = envelope.errors.filter(|errors| !errors.is_empty()) {
            let message = errors
                .into_iter()
                .map(|error| error.message)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(InfraError::graphql(message));
        }

        envelope
            .data
            .ok_or_else(|| InfraError::decode("response carried no data"))
    }
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;
    use serde_json::{Value, json};

    use super::*;

    fn client(server: &MockServer) -> GraphQlClient {
        GraphQlClient::new(Url::parse(&server.url("/graphql")).expect("url")).expect("client")
    }

    #[tokio::test]
    async fn graphql_errors_are_reported() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("POST").path("/graphql");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"data":null,"errors":[{"message":"boom"}]}"#);
        });

        let result = client(&server)
            .execute::<Value>(&GraphQlRequest::new("query { x }", json!({})))
            .await;

        mock.assert();
        assert!(matches!(result, Err(InfraError::GraphQl { message }) if message == "boom"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/graphql");
            then.status(502);
        });

        let result = client(&server)
            .execute::<Value>(&GraphQlRequest::new("query { x }", json!({})))
            .await;

        assert!(matches!(result, Err(InfraError::Status { status: 502, .. })));
    }

    #[tokio::test]
    async fn decodes_data_member() -> Result<(), InfraError> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("POST")
                .path("/graphql")
                .json_body_includes(r#"{"query":"query { value }"}"#);
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"data":{"value":3}}"#);
        });

        let data: Value = client(&server)
            .execute(&GraphQlRequest::new("query { value }", json!({})))
            .await?;

        mock.assert();
        assert_eq!(data["value"], 3);
        Ok(())
    }
}
