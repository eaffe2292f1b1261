use super::{Sink, SinkError, endpoint_url};
use crate::view_event::ViewEvent;
use async_trait::async_trait;
use url::Url;

/// Posts the plain JSON document to a fixed URL with a static bearer token.
pub struct BearerSink {
    name: &'static str,
    client: reqwest::Client,
    url: Url,
    access_token: String,
}

impl BearerSink {
    pub fn new(
        name: &'static str,
        client: reqwest::Client,
        endpoint: &Url,
        path: &str,
        access_token: String,
    ) -> Result<Self, SinkError> {
        Ok(BearerSink {
            name,
            client,
            url: endpoint_url(endpoint, path)?,
            access_token,
        })
    }
}

#[async_trait]
impl Sink for BearerSink {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn send(&self, event: &ViewEvent) -> Result<(), SinkError> {
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.access_token)
            .json(event)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(SinkError::UnexpectedStatus(status)),
        }
    }
}
