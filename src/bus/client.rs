//! Thin wrapper over the durable pub/sub bus (§4.3, C1).
//!
//! Grounded directly on the original implementation's `shared/nats.py`:
//! connect once, `nc.jetstream()`, `js.add_stream(name, subjects,
//! retention="workqueue")`, `js.subscribe(...)`, manual ack. `async-nats` is
//! the Rust crate that speaks the same protocol (NATS JetStream) with the
//! same durable-consumer and work-queue-retention primitives.

use crate::error::{BusError, Result};
use async_nats::jetstream::{self, consumer::AckPolicy, stream::RetentionPolicy};
use std::time::Duration;

/// Name of the single shared stream carrying all traffic (§3, §6).
pub const STREAM_NAME: &str = "dreambot";

/// Subject space covered by the stream.
pub const STREAM_SUBJECTS: [&str; 2] = ["frontend.>", "backend.>"];

/// How long a pull waits for a message before yielding control back to the
/// pump loop (§4.3 step 5: "fetch next message with a short timeout; on
/// timeout, yield").
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Backoff used after a duplicate-consumer rejection or a refused/reset
/// connection (§5 "Backoff": "wait ≈5 s and retry").
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

pub struct BusClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl BusClient {
    /// Connect to the bus. `uris` is the set of broker endpoints from
    /// `nats_uri` (§6); any one of them may be used to bootstrap the
    /// connection.
    pub async fn connect(uris: &[String]) -> Result<Self> {
        let joined = uris.join(",");
        let client = async_nats::connect(joined)
            .await
            .map_err(|e| BusError::Fatal(format!("failed to connect to bus: {e}")))?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    /// Ensure the shared work-queue stream exists (§4.3 step 3).
    pub async fn ensure_stream(&self) -> Result<jetstream::stream::Stream> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: STREAM_NAME.to_string(),
                subjects: STREAM_SUBJECTS.iter().map(|s| s.to_string()).collect(),
                retention: RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Other(anyhow::anyhow!("ensure_stream failed: {e}")).into())
    }

    /// Create or attach to a durable consumer for `subject_filter`, named
    /// `durable_name` (the worker's address with `.` replaced by `_`),
    /// matching §4.3 step 4.
    pub async fn ensure_consumer(
        &self,
        stream: &jetstream::stream::Stream,
        durable_name: &str,
        subject_filter: &str,
    ) -> Result<jetstream::consumer::PullConsumer> {
        stream
            .get_or_create_consumer(
                durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: subject_filter.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify_consumer_error(durable_name, e))
    }

    /// Encode and publish an envelope on its `to` subject (§4.3 step 7).
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Transient(format!("publish failed: {e}")))?
            .await
            .map_err(|e| BusError::Transient(format!("publish ack failed: {e}")))?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.client
            .clone()
            .flush()
            .await
            .map_err(|e| BusError::Other(anyhow::anyhow!("flush on shutdown failed: {e}")))?;
        Ok(())
    }
}

fn classify_consumer_error(durable_name: &str, err: impl std::fmt::Display) -> crate::Error {
    let msg = err.to_string();
    if msg.to_lowercase().contains("already") || msg.to_lowercase().contains("bad request") {
        BusError::DuplicateConsumer(durable_name.to_string()).into()
    } else {
        BusError::Other(anyhow::anyhow!("ensure_consumer failed: {msg}")).into()
    }
}
