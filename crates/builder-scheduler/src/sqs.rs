//! Amazon SQS work queue over the JSON protocol.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::queue::{QueueError, QueueMessage, WorkQueue};
use crate::sigv4::{Credentials, SignableRequest, Signer};

const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const TARGET_PREFIX: &str = "AmazonSQS.";

/// Connection settings for [`SqsQueue`].
#[derive(Debug, Clone)]
pub struct SqsConfig {
    pub queue_url: Url,
    pub region: String,
    /// Where requests are sent. Defaults to the queue URL's origin.
    pub endpoint: Option<Url>,
    pub wait_time: Duration,
    pub visibility_timeout: Duration,
}

/// SQS queue client.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: reqwest::Client,
    config: SqsConfig,
    endpoint: Url,
    signer: Signer,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageResponse {
    #[serde(default)]
    messages: Vec<SqsMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SqsMessage {
    message_id: String,
    receipt_handle: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

impl SqsQueue {
    pub fn new(config: SqsConfig, credentials: Credentials) -> Result<Self, QueueError> {
        let endpoint = match &config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => {
                let mut origin = config.queue_url.clone();
                origin.set_path("/");
                origin.set_query(None);
                origin
            }
        };
        if endpoint.host_str().is_none() {
            return Err(QueueError::Config(format!("endpoint {} has no host", endpoint)));
        }

        // Long polls must not hit the client timeout.
        let client = reqwest::Client::builder()
            .timeout(config.wait_time + Duration::from_secs(10))
            .build()?;
        let signer = Signer::new(credentials, config.region.clone(), "sqs");

        Ok(Self {
            client,
            config,
            endpoint,
            signer,
        })
    }

    pub fn queue_url(&self) -> &Url {
        &self.config.queue_url
    }

    fn host_header(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    async fn call(&self, action: &str, body: Value) -> Result<Value, QueueError> {
        let payload = serde_json::to_vec(&body)
            .map_err(|e| QueueError::InvalidResponse(format!("encoding request: {}", e)))?;
        let now = Utc::now();
        let target = format!("{}{}", TARGET_PREFIX, action);

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), CONTENT_TYPE.to_string());
        headers.insert("host".to_string(), self.host_header());
        headers.insert("x-amz-date".to_string(), Signer::amz_date(now));
        headers.insert("x-amz-target".to_string(), target);
        if let Some(token) = &self.signer.credentials().session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        let authorization = self.signer.authorization(
            &SignableRequest {
                method: "POST",
                path: self.endpoint.path(),
                query: "",
                headers: &headers,
                payload: &payload,
            },
            now,
        );

        let mut request = self.client.post(self.endpoint.clone());
        for (name, value) in &headers {
            // reqwest derives Host from the URL.
            if name != "host" {
                request = request.header(name, value);
            }
        }
        let response = request
            .header("authorization", authorization)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            let error: ErrorResponse = serde_json::from_slice(&bytes).unwrap_or_default();
            return Err(QueueError::Service {
                status: status.as_u16(),
                code: error.kind,
                message: error.message,
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| QueueError::InvalidResponse(format!("{}: {}", action, e)))
    }
}

#[async_trait]
impl WorkQueue for SqsQueue {
    async fn receive(&self) -> Result<Option<QueueMessage>, QueueError> {
        let response = self
            .call(
                "ReceiveMessage",
                json!({
                    "QueueUrl": self.config.queue_url.as_str(),
                    "MaxNumberOfMessages": 1,
                    "WaitTimeSeconds": self.config.wait_time.as_secs(),
                    "VisibilityTimeout": self.config.visibility_timeout.as_secs(),
                }),
            )
            .await?;
        let parsed = parse_receive(response)?;
        if let Some(message) = &parsed {
            debug!(message_id = %message.id, "Received queue message");
        }
        Ok(parsed)
    }

    async fn extend_visibility(
        &self,
        message: &QueueMessage,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        self.call(
            "ChangeMessageVisibility",
            json!({
                "QueueUrl": self.config.queue_url.as_str(),
                "ReceiptHandle": message.receipt_handle,
                "VisibilityTimeout": timeout.as_secs(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.call(
            "DeleteMessage",
            json!({
                "QueueUrl": self.config.queue_url.as_str(),
                "ReceiptHandle": message.receipt_handle,
            }),
        )
        .await?;
        Ok(())
    }
}

fn parse_receive(response: Value) -> Result<Option<QueueMessage>, QueueError> {
    if response.is_null() {
        return Ok(None);
    }
    let parsed: ReceiveMessageResponse = serde_json::from_value(response)
        .map_err(|e| QueueError::InvalidResponse(format!("ReceiveMessage: {}", e)))?;
    Ok(parsed.messages.into_iter().next().map(|m| QueueMessage {
        id: m.message_id,
        receipt_handle: m.receipt_handle,
        body: m.body,
    }))
}
