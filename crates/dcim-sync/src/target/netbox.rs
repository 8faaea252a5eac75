//! NetBox REST adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{EntityKind, Fields, ObjectRef, Query, RemoteObject, TargetError, TargetSystem};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Page size requested from list endpoints.
const PAGE_SIZE: u32 = 1000;

/// One page of a list endpoint.
#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<Value>,
}

/// NetBox client.
#[derive(Clone)]
pub struct NetBox {
    client: Client,
    base_url: String,
    token: String,
}

impl NetBox {
    /// Create a client for the NetBox instance at `base_url`.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        verify_tls: bool,
    ) -> Result<Self, TargetError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    const fn endpoint(kind: EntityKind) -> &'static str {
        match kind {
            EntityKind::Device => "dcim/devices",
            EntityKind::Manufacturer => "dcim/manufacturers",
            EntityKind::DeviceType => "dcim/device-types",
            EntityKind::Site => "dcim/sites",
            EntityKind::Location => "dcim/locations",
            EntityKind::Rack => "dcim/racks",
            EntityKind::Platform => "dcim/platforms",
            EntityKind::Role => "dcim/device-roles",
            EntityKind::Interface => "dcim/interfaces",
            EntityKind::IpAddress => "ipam/ip-addresses",
        }
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}/api/{}/", self.base_url, Self::endpoint(kind))
    }

    fn object_url(&self, target: ObjectRef) -> String {
        format!("{}{}/", self.collection_url(target.kind), target.id)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json")
    }

    async fn handle_response(response: reqwest::Response) -> Result<Value, TargetError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                TargetError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(TargetError::NotFound(text))
        } else {
            Err(TargetError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    fn to_object(kind: EntityKind, value: Value) -> Result<RemoteObject, TargetError> {
        let Value::Object(fields) = value else {
            return Err(TargetError::Malformed(format!("{kind} is not a JSON object")));
        };
        let id = fields
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| TargetError::Malformed(format!("{kind} has no id")))?;
        Ok(RemoteObject::new(kind, id, fields))
    }
}

#[async_trait]
impl TargetSystem for NetBox {
    fn name(&self) -> &'static str {
        "netbox"
    }

    async fn list(&self, kind: EntityKind, query: &Query) -> Result<Vec<RemoteObject>, TargetError> {
        let url = self.collection_url(kind);
        debug!(url = %url, query = %query, "GET request");

        let mut request = self
            .client
            .get(&url)
            .query(query.params())
            .query(&[("limit", PAGE_SIZE)]);
        let mut objects = Vec::new();

        loop {
            let response = self.authorized(request).send().await?;
            let page: Page = serde_json::from_value(Self::handle_response(response).await?)?;
            for value in page.results {
                objects.push(Self::to_object(kind, value)?);
            }
            match page.next {
                Some(next) => {
                    debug!(url = %next, "Following pagination");
                    request = self.client.get(next);
                }
                None => break,
            }
        }

        Ok(objects)
    }

    async fn create(&self, kind: EntityKind, fields: Fields) -> Result<RemoteObject, TargetError> {
        let url = self.collection_url(kind);
        debug!(url = %url, "POST request");

        let response = self
            .authorized(self.client.post(&url))
            .json(&fields)
            .send()
            .await?;
        Self::to_object(kind, Self::handle_response(response).await?)
    }

    async fn update(&self, target: ObjectRef, fields: Fields) -> Result<(), TargetError> {
        let url = self.object_url(target);
        debug!(url = %url, "PATCH request");

        let response = self
            .authorized(self.client.patch(&url))
            .json(&fields)
            .send()
            .await?;
        Self::handle_response(response).await.map(|_| ())
    }

    async fn delete(&self, target: ObjectRef) -> Result<(), TargetError> {
        let url = self.object_url(target);
        debug!(url = %url, "DELETE request");

        let response = self.authorized(self.client.delete(&url)).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(TargetError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    async fn check(&self) -> Result<(), TargetError> {
        let url = format!("{}/api/status/", self.base_url);
        let response = self.authorized(self.client.get(&url)).send().await?;
        Self::handle_response(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> NetBox {
        NetBox::new(server.uri(), "secret", true).unwrap()
    }

    #[tokio::test]
    async fn test_list_follows_pagination() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/dcim/devices/"))
            .and(query_param("cf_zabbix_hostid", "100"))
            .and(header("Authorization", "Token secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 2,
                "next": format!("{}/api/dcim/devices/page2", server.uri()),
                "results": [{"id": 1, "name": "srv-a"}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/dcim/devices/page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 2,
                "next": null,
                "results": [{"id": 2, "name": "srv-b"}]
            })))
            .mount(&server)
            .await;

        let netbox = client(&server).await;
        let query = Query::new().eq("cf_zabbix_hostid", "100");
        let devices = netbox.list(EntityKind::Device, &query).await.unwrap();

        let ids: Vec<u64> = devices.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_create_posts_fields() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/dcim/manufacturers/"))
            .and(body_json(json!({"name": "Dell", "slug": "dell"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 12, "name": "Dell", "slug": "dell"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let netbox = client(&server).await;
        let fields = json!({"name": "Dell", "slug": "dell"}).as_object().cloned().unwrap();
        let created = netbox.create(EntityKind::Manufacturer, fields).await.unwrap();
        assert_eq!(created.id, 12);
        assert_eq!(created.name(), Some("Dell"));
    }

    #[tokio::test]
    async fn test_update_maps_api_errors() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/api/dcim/devices/5/"))
            .respond_with(ResponseTemplate::new(400).set_body_string("{\"position\": [\"occupied\"]}"))
            .mount(&server)
            .await;

        let netbox = client(&server).await;
        let err = netbox
            .update(ObjectRef::new(EntityKind::Device, 5), Fields::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::Api { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_object() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/ipam/ip-addresses/9/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let netbox = client(&server).await;
        assert!(netbox
            .delete(ObjectRef::new(EntityKind::IpAddress, 9))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_check_hits_status_endpoint() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/status/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"netbox-version": "4.1"})))
            .expect(1)
            .mount(&server)
            .await;

        assert!(client(&server).await.check().await.is_ok());
    }
}
