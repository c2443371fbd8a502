//! Subscription REST resource: creating and deleting server-side
//! subscription records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::AuthCredential;
use crate::types::{Config, Error};

pub(crate) const SUBSCRIPTIONS_PATH: &str = "/api/v2/subscriptions";

#[async_trait]
pub trait SubscriptionApi: Send + Sync + 'static {
    /// Create a subscription of `group_id` to `stream`, returning the
    /// server-assigned subscription ID.
    async fn create(
        &self,
        credential: &AuthCredential,
        group_id: &str,
        stream: &str,
    ) -> Result<String, Error>;

    async fn delete(&self, credential: &AuthCredential, id: &str) -> Result<(), Error>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub group_id: String,
    pub streams: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    #[serde(rename = "_id", default)]
    pub id: String,
}

/// [`SubscriptionApi`] over HTTPS.
pub struct RestSubscriptionApi {
    http: reqwest::Client,
    subscriptions_url: url::Url,
}

impl RestSubscriptionApi {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let scheme = if config.use_tls { "https" } else { "http" };
        let subscriptions_url = url::Url::parse(&format!(
            "{scheme}://{}{SUBSCRIPTIONS_PATH}",
            config.rest_host()
        ))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            subscriptions_url,
        })
    }

    fn subscription_url(&self, id: &str) -> Result<url::Url, Error> {
        let mut u = self.subscriptions_url.clone();
        u.path_segments_mut()
            .map_err(|()| Error::Protocol(format!("cannot append to {}", self.subscriptions_url)))?
            .push(id);
        Ok(u)
    }
}

#[async_trait]
impl SubscriptionApi for RestSubscriptionApi {
    async fn create(
        &self,
        credential: &AuthCredential,
        group_id: &str,
        stream: &str,
    ) -> Result<String, Error> {
        let body = SubscriptionRequest {
            group_id: group_id.to_string(),
            streams: vec![stream.to_string()],
        };
        let resp = self
            .http
            .post(self.subscriptions_url.clone())
            .header(credential.header, credential.value.as_slice())
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .inspect_err(|e| {
                tracing::error!(stream, "Unexpected response while creating the subscription: {e}");
            })?
            .json::<SubscriptionResponse>()
            .await?;
        tracing::debug!(stream, id = %resp.id, "Subscription created");
        Ok(resp.id)
    }

    async fn delete(&self, credential: &AuthCredential, id: &str) -> Result<(), Error> {
        tracing::debug!(id, "Deleting subscription");
        self.http
            .delete(self.subscription_url(id)?)
            .header(credential.header, credential.value.as_slice())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(rest_host: Option<&str>) -> RestSubscriptionApi {
        let mut config = Config::new("group", "dxhub.example.com").with_api_key(|| Ok(vec![]));
        config.rest_host = rest_host.map(str::to_string);
        RestSubscriptionApi::from_config(&config).unwrap()
    }

    #[test]
    fn subscriptions_url_defaults_to_domain() {
        assert_eq!(
            api(None).subscriptions_url.as_str(),
            "https://dxhub.example.com/api/v2/subscriptions"
        );
    }

    #[test]
    fn subscription_url_escapes_id() {
        let url = api(Some("127.0.0.1:8443")).subscription_url("a/b c").unwrap();
        assert_eq!(
            url.as_str(),
            "https://127.0.0.1:8443/api/v2/subscriptions/a%2Fb%20c"
        );
    }

    #[test]
    fn request_body_shape() {
        let body = SubscriptionRequest {
            group_id: "group".to_string(),
            streams: vec!["orders".to_string()],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"groupId": "group", "streams": ["orders"]}));
    }

    #[test]
    fn response_reads_underscore_id() {
        let resp: SubscriptionResponse = serde_json::from_str(r#"{"_id": "sub-42"}"#).unwrap();
        assert_eq!(resp.id, "sub-42");
        let resp: SubscriptionResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.id.is_empty());
    }
}
