use super::{Sink, SinkError, endpoint_url};
use crate::config::FirestoreSinkConfig;
use crate::credentials::{AccessCredentials, HttpTokenEndpoint, Rs256Signer, SystemClock};
use crate::view_event::{FieldValue, ViewEvent, format_timestamp};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

const COLLECTION: &str = "web-views";

/// Writes each view event as a new document in the `web-views` collection.
pub struct FirestoreSink {
    client: reqwest::Client,
    documents_url: Url,
    credentials: Arc<AccessCredentials>,
}

impl FirestoreSink {
    pub fn new(
        client: reqwest::Client,
        endpoint: &Url,
        project_id: &str,
        credentials: Arc<AccessCredentials>,
    ) -> Result<Self, SinkError> {
        let path = format!("projects/{project_id}/databases/(default)/documents/{COLLECTION}");
        Ok(FirestoreSink {
            client,
            documents_url: endpoint_url(endpoint, &path)?,
            credentials,
        })
    }

    pub fn from_config(
        client: reqwest::Client,
        config: &FirestoreSinkConfig,
    ) -> Result<Self, SinkError> {
        let account = &config.service_account;
        let signer = Rs256Signer::from_pem(&account.private_key())?;
        let credentials = AccessCredentials::new(
            account.client_email.clone(),
            account.token_uri.to_string(),
            Arc::new(SystemClock),
            Box::new(signer),
            Box::new(HttpTokenEndpoint::new(
                client.clone(),
                account.token_uri.clone(),
            )),
        );

        Self::new(
            client,
            &config.endpoint,
            &config.project_id,
            Arc::new(credentials),
        )
    }
}

#[async_trait]
impl Sink for FirestoreSink {
    fn name(&self) -> &'static str {
        "firestore"
    }

    async fn send(&self, event: &ViewEvent) -> Result<(), SinkError> {
        let token = self.credentials.get().await?;

        let mut url = self.documents_url.clone();
        url.query_pairs_mut()
            .append_pair("documentId", &Uuid::new_v4().to_string());

        let response = self
            .client
            .post(url)
            .bearer_auth(token.secret())
            .json(&FirestoreDocument::from(event))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(SinkError::UnexpectedStatus(status)),
        }
    }
}

/// Firestore's REST representation, where every value carries its type.
#[derive(Debug, Serialize)]
pub struct FirestoreDocument<'a> {
    fields: IndexMap<&'static str, TypedValue<'a>>,
}

#[derive(Debug, Serialize)]
enum TypedValue<'a> {
    #[serde(rename = "stringValue")]
    String(&'a str),
    // 64-bit integers travel as JSON strings
    #[serde(rename = "integerValue")]
    Integer(String),
    #[serde(rename = "timestampValue")]
    Timestamp(String),
}

impl<'a> From<&'a ViewEvent> for FirestoreDocument<'a> {
    fn from(event: &'a ViewEvent) -> Self {
        let fields = event
            .fields()
            .map(|(name, value)| {
                let typed = match value {
                    FieldValue::String(s) => TypedValue::String(s.as_str()),
                    FieldValue::Integer(i) => TypedValue::Integer(i.to_string()),
                    FieldValue::Timestamp(ts) => TypedValue::Timestamp(format_timestamp(ts)),
                };
                (name, typed)
            })
            .collect();

        FirestoreDocument { fields }
    }
}
