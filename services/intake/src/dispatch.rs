//! Hand-off of uploaded videos to downstream processing.
//!
//! Two interchangeable strategies: a Kafka job message, or an asynchronous
//! function invocation over HTTP. Either way success means the downstream
//! side has accepted the job, not that processing finished.

use crate::config::{DispatchConfig, DispatchStrategy, InvokeConfig, KafkaConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur while dispatching a job
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to create dispatcher: {0}")]
    CreationError(String),

    #[error("Failed to serialize job: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Failed to send job to {destination}: {message}")]
    SendError {
        destination: String,
        message: String,
    },

    #[error("Invocation rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Job handed to downstream processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub submission_id: Uuid,
    pub volunteer_id: String,
    pub s3_key: String,
    pub bucket: String,
    pub title: String,
    pub description: Option<String>,
    pub sender_name: String,
    pub sender_phone: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// Body of an asynchronous function invocation
#[derive(Debug, Serialize)]
pub struct InvokePayload<'a> {
    pub submission_id: Uuid,
    pub volunteer_id: &'a str,
    pub s3_key: &'a str,
    pub video_title: &'a str,
}

impl ProcessingJob {
    pub fn invoke_payload(&self) -> InvokePayload<'_> {
        InvokePayload {
            submission_id: self.submission_id,
            volunteer_id: &self.volunteer_id,
            s3_key: &self.s3_key,
            video_title: &self.title,
        }
    }

    /// Indexed attributes attached to queue messages
    pub fn message_attributes(&self) -> Vec<(&'static str, String)> {
        vec![
            ("submission_id", self.submission_id.to_string()),
            ("volunteer_id", self.volunteer_id.clone()),
            ("message-type", "video_processing_job".to_string()),
        ]
    }
}

/// Acknowledgement returned by the downstream side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub message_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, job: &ProcessingJob) -> Result<DispatchReceipt, DispatchError>;
}

/// Build the dispatcher selected by configuration
pub fn build_dispatcher(config: &DispatchConfig) -> Result<Arc<dyn Dispatcher>, DispatchError> {
    match config.strategy {
        DispatchStrategy::Queue => {
            let kafka = config.kafka.as_ref().ok_or_else(|| {
                DispatchError::CreationError("dispatch.kafka is not configured".to_string())
            })?;
            Ok(Arc::new(KafkaDispatcher::new(kafka)?))
        }
        DispatchStrategy::Invoke => {
            let invoke = config.invoke.as_ref().ok_or_else(|| {
                DispatchError::CreationError("dispatch.invoke is not configured".to_string())
            })?;
            Ok(Arc::new(InvokeDispatcher::new(invoke)?))
        }
    }
}

/// Queue strategy: one JSON job message per submission on a Kafka topic
pub struct KafkaDispatcher {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaDispatcher {
    pub fn new(config: &KafkaConfig) -> Result<Self, DispatchError> {
        info!("Creating Kafka producer for {}", config.bootstrap_servers);

        let delivery_timeout = Duration::from_secs(config.delivery_timeout_secs);
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", delivery_timeout.as_millis().to_string());

        // Configure SSL if enabled
        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| DispatchError::CreationError(e.to_string()))?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            delivery_timeout,
        })
    }
}

#[async_trait]
impl Dispatcher for KafkaDispatcher {
    #[instrument(skip(self, job), fields(submission_id = %job.submission_id, topic = %self.topic))]
    async fn dispatch(&self, job: &ProcessingJob) -> Result<DispatchReceipt, DispatchError> {
        let payload = serde_json::to_vec(job)?;
        let key = job.submission_id.to_string();

        let headers = job
            .message_attributes()
            .iter()
            .fold(OwnedHeaders::new(), |headers, (name, value)| {
                headers.insert(Header {
                    key: name,
                    value: Some(value.as_str()),
                })
            });

        let record = FutureRecord::to(&self.topic)
            .payload(&payload)
            .key(&key)
            .headers(headers);

        debug!(size_bytes = payload.len(), "Sending processing job");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| DispatchError::SendError {
                destination: self.topic.clone(),
                message: e.to_string(),
            })?;

        let message_id = format!("{}/{}@{}", self.topic, partition, offset);
        info!(message_id = %message_id, "Processing job enqueued");

        Ok(DispatchReceipt { message_id })
    }
}

impl Drop for KafkaDispatcher {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.producer.flush(Timeout::After(Duration::from_secs(5))) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}

/// Invoke strategy: POST the job to a function endpoint for async execution
pub struct InvokeDispatcher {
    client: reqwest::Client,
    endpoint_url: String,
    auth_token: Option<String>,
}

impl InvokeDispatcher {
    pub fn new(config: &InvokeConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DispatchError::CreationError(e.to_string()))?;

        Ok(Self {
            client,
            endpoint_url: config.endpoint_url.clone(),
            auth_token: config.auth_token.clone(),
        })
    }
}

#[async_trait]
impl Dispatcher for InvokeDispatcher {
    #[instrument(skip(self, job), fields(submission_id = %job.submission_id))]
    async fn dispatch(&self, job: &ProcessingJob) -> Result<DispatchReceipt, DispatchError> {
        let mut request = self
            .client
            .post(&self.endpoint_url)
            .header("X-Amz-Invocation-Type", "Event")
            .json(&job.invoke_payload());

        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| DispatchError::SendError {
            destination: self.endpoint_url.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if status != StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let message_id = response
            .headers()
            .get("x-amzn-requestid")
            .and_then(|value| value.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| format!("invoke-{}", job.submission_id));

        info!(message_id = %message_id, "Processing function invoked");
        Ok(DispatchReceipt { message_id })
    }
}
