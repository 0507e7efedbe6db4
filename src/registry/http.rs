use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tracing::{debug, trace};

use super::{
    DataPoint, Entity, NewProperty, Registry, RegistryError, RegistryResult,
};
use crate::{config::RegistryConfig, PropertyId};

#[derive(Debug, Deserialize)]
struct CreatedProperty {
    property: CreatedPropertyBody,
}

#[derive(Debug, Deserialize)]
struct CreatedPropertyBody {
    id: PropertyId,
}

#[derive(Debug, Deserialize)]
struct ThingEnvelope {
    thing: Entity,
}

/// Registry client speaking JSON over HTTP with bearer-token auth.
pub struct HttpRegistry {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpRegistry {
    pub fn new(config: &RegistryConfig) -> RegistryResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RegistryError::RequestFailed {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone().map(SecretString::from),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> RegistryResult<Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| RegistryError::RequestFailed {
                message: e.to_string(),
            })
    }

    async fn check(response: Response) -> RegistryResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RegistryError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> RegistryResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn create_property(&self, property: NewProperty) -> RegistryResult<PropertyId> {
        let url = format!("{}/things/{}/properties", self.base_url, property.entity_id);
        debug!("Creating property {} for {}", property.name, property.entity_id);
        let response = self.send(self.client.post(&url).json(&property)).await?;
        let created: CreatedProperty = Self::decode(Self::check(response).await?).await?;
        Ok(created.property.id)
    }

    async fn read_entity(&self, entity_id: &str) -> RegistryResult<Entity> {
        let url = format!("{}/things/{}", self.base_url, entity_id);
        trace!("Reading entity {}", entity_id);
        let response = self.send(self.client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(entity_id.to_string()));
        }
        let envelope: ThingEnvelope = Self::decode(Self::check(response).await?).await?;
        Ok(envelope.thing)
    }

    async fn update_values(
        &self,
        property_id: &str,
        values: Vec<DataPoint>,
    ) -> RegistryResult<()> {
        let url = format!("{}/properties/{}/values", self.base_url, property_id);
        let body = json!({ "id": property_id, "values": values });
        let response = self.send(self.client.put(&url).json(&body)).await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DATA_ACTIVITY_NAME, DATA_COUNT_NAME};
    use mockito::Matcher;
    use std::time::Duration;

    fn registry(url: &str) -> HttpRegistry {
        HttpRegistry::new(&RegistryConfig {
            base_url: format!("{}/", url),
            token: Some("secret-token".to_string()),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_property() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/things/t1/properties")
            .match_header("authorization", "Bearer secret-token")
            .match_body(Matcher::PartialJson(json!({
                "name": "Data Count",
                "type": "COUNT",
                "entityId": "t1"
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"property":{"id":"p-count","name":"Data Count"}}"#)
            .create_async()
            .await;

        let id = registry(&server.url())
            .create_property(NewProperty::data_count("t1"))
            .await
            .unwrap();
        assert_eq!(id, "p-count");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_read_entity() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/things/t1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"thing":{"id":"t1","properties":[
                    {"id":"p1","name":"Data Count"},
                    {"id":"p2","name":"Data Activity"}]}}"#,
            )
            .create_async()
            .await;

        let entity = registry(&server.url()).read_entity("t1").await.unwrap();
        assert_eq!(entity.id, "t1");
        assert_eq!(entity.find_property_by_name(DATA_COUNT_NAME).unwrap().id, "p1");
        assert_eq!(
            entity.find_property_by_name(DATA_ACTIVITY_NAME).unwrap().id,
            "p2"
        );
    }

    #[tokio::test]
    async fn test_read_missing_entity() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/things/ghost")
            .with_status(404)
            .create_async()
            .await;

        let result = registry(&server.url()).read_entity("ghost").await;
        assert!(matches!(result, Err(RegistryError::NotFound(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_update_values_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/properties/p1/values")
            .match_body(Matcher::PartialJson(json!({"values": [[10, 3]]})))
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let result = registry(&server.url())
            .update_values("p1", vec![DataPoint(10, 3)])
            .await;
        match result {
            Err(RegistryError::Status { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
