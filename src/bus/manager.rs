//! Bus manager: per-worker addressing, subscription pump, ack policy (§4.3).

use crate::address::{WorkerAddress, WorkerEnd};
use crate::bus::client::{BusClient, FETCH_TIMEOUT, RETRY_BACKOFF};
use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::worker::{Readiness, SendFn, Worker};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;

struct RegisteredWorker {
    address: WorkerAddress,
    worker: Arc<dyn Worker>,
    readiness: Readiness,
}

/// Owns the bus connection; for every registered worker, ensures the shared
/// stream exists, attaches a durable consumer, and pumps messages into the
/// worker, acking on success (§4.3).
pub struct BusManager {
    bus: Arc<BusClient>,
    workers: Vec<RegisteredWorker>,
    tasks: Vec<JoinHandle<()>>,
}

impl BusManager {
    pub async fn connect(uris: &[String]) -> Result<Self> {
        let bus = Arc::new(BusClient::connect(uris).await?);
        bus.ensure_stream().await?;
        Ok(Self {
            bus,
            workers: Vec::new(),
            tasks: Vec::new(),
        })
    }

    /// Register a worker under `end`/`name`/`subname`. The worker's `boot`
    /// is NOT started here; call [`BusManager::run`] once all workers are
    /// registered.
    pub fn register(
        &mut self,
        end: WorkerEnd,
        name: impl Into<String>,
        subname: Option<String>,
        worker: Arc<dyn Worker>,
    ) -> WorkerAddress {
        let address = WorkerAddress::new(end, name, subname);
        self.workers.push(RegisteredWorker {
            address: address.clone(),
            worker,
            readiness: Readiness::new(),
        });
        address
    }

    /// Boot every registered worker and spawn its subscription pump
    /// (§4.3 steps 2-6). Returns once all pump tasks have been spawned;
    /// the tasks themselves run until [`BusManager::shutdown`].
    pub async fn run(&mut self) -> Result<()> {
        for registered in &self.workers {
            let stream = self.bus.ensure_stream().await?;
            let consumer = loop {
                match self
                    .bus
                    .ensure_consumer(&stream, &registered.address.consumer_name(), &registered.address.subject())
                    .await
                {
                    Ok(consumer) => break consumer,
                    Err(crate::Error::Bus(BusError::DuplicateConsumer(name))) => {
                        tracing::warn!(consumer = %name, "durable consumer already exists, backing off");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };

            let bus = self.bus.clone();
            let worker = registered.worker.clone();
            let address = registered.address.clone();
            let readiness = registered.readiness.clone();

            let send: SendFn = {
                let bus = bus.clone();
                Arc::new(move |envelope: Envelope| {
                    let bus = bus.clone();
                    Box::pin(async move {
                        tracing::debug!(envelope = %envelope.redacted_debug(), "publishing");
                        let subject = envelope.to.clone();
                        let payload = envelope.to_json_bytes();
                        bus.publish(&subject, payload).await
                    })
                })
            };

            {
                let worker = worker.clone();
                let address2 = address.clone();
                let readiness2 = readiness.clone();
                let send2 = send.clone();
                tokio::spawn(async move {
                    if let Err(e) = worker.boot(address2, readiness2, send2).await {
                        tracing::error!(error = %e, "worker boot failed");
                    }
                });
            }

            let pump_address = address.clone();
            let handle = tokio::spawn(async move {
                pump_loop(consumer, worker, pump_address, readiness).await;
            });
            self.tasks.push(handle);
        }
        Ok(())
    }

    /// Cancel all subscription tasks, wait a bounded grace period, close the
    /// connection (§4.3 step 8).
    pub async fn shutdown(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for registered in &self.workers {
            if let Err(e) = registered.worker.shutdown().await {
                tracing::warn!(error = %e, "worker shutdown failed");
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        self.bus.close().await
    }
}

/// Per-worker pump loop (§4.3 step 5). Fetches one message at a time;
/// `receive` runs to completion before the next fetch for this worker.
async fn pump_loop(
    mut consumer: async_nats::jetstream::consumer::PullConsumer,
    worker: Arc<dyn Worker>,
    address: WorkerAddress,
    readiness: Readiness,
) {
    loop {
        let batch = match consumer.fetch().max_messages(1).expires(FETCH_TIMEOUT).messages().await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "consumer fetch failed, retrying");
                tokio::time::sleep(RETRY_BACKOFF).await;
                continue;
            }
        };
        tokio::pin!(batch);

        match tokio::time::timeout(FETCH_TIMEOUT, batch.next()).await {
            Ok(Some(Ok(message))) => {
                if !readiness.is_ready() {
                    // Hold inbound messages until the worker has finished
                    // booting, without acking or dropping them (§4.1
                    // rationale: "C3 must hold inbound messages until the
                    // worker has fully initialised").
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    continue;
                }

                let subject = message.subject.to_string();
                let envelope = match Envelope::from_json_bytes(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::error!(address = %address, error = %e, "poison message, acking and dropping");
                        let _ = message.ack().await;
                        continue;
                    }
                };

                let should_ack = match worker.receive(&subject, envelope).await {
                    Ok(ack) => ack,
                    Err(e) => {
                        // §7 *Poison*: any exception escaping receive is
                        // logged and acked so it doesn't wedge the queue.
                        tracing::error!(address = %address, error = %e, "receive() failed, acking (poison policy)");
                        true
                    }
                };

                if should_ack {
                    if let Err(e) = message.ack().await {
                        tracing::warn!(address = %address, error = %e, "ack failed");
                    }
                } else {
                    tracing::debug!(address = %address, "receive() returned false, not acking");
                }
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(address = %address, error = %e, "message fetch error");
            }
            Ok(None) | Err(_) => {
                // Timeout or batch exhausted: yield and fetch again.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWorker {
        acked: Arc<AtomicUsize>,
        reply: bool,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        fn name(&self) -> &str {
            "counter"
        }
        async fn boot(&self, _a: WorkerAddress, r: Readiness, _s: SendFn) -> Result<()> {
            r.set_ready();
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
        async fn receive(&self, _subject: &str, _envelope: Envelope) -> Result<bool> {
            self.acked.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply)
        }
    }

    /// Testable property 3 (acknowledgement law), exercised directly against
    /// the worker contract rather than a live broker: `receive` returning
    /// `true` is distinguishable from `receive` returning `false`.
    #[tokio::test]
    async fn receive_return_value_governs_ack_decision() {
        let acked = Arc::new(AtomicUsize::new(0));
        let worker = CountingWorker { acked: acked.clone(), reply: true };
        let env = Envelope::request("backend.x", "frontend.y", "!t", "p", "irc", Default::default());
        let ack = worker.receive("backend.x", env).await.unwrap();
        assert!(ack);
        assert_eq!(acked.load(Ordering::SeqCst), 1);

        let worker = CountingWorker { acked: acked.clone(), reply: false };
        let env = Envelope::request("backend.x", "frontend.y", "!t", "p", "irc", Default::default());
        let ack = worker.receive("backend.x", env).await.unwrap();
        assert!(!ack);
    }
}
