//! Generic worker lifecycle (§4.1, C2).
//!
//! Mirrors the original implementation's `DreambotWorkerBase`: a worker owns
//! its address, a readiness flag, and `boot`/`shutdown`/`receive`. Dynamic
//! dispatch is modeled per §9's "Replacing dynamic dispatch" note as a plain
//! object-safe trait, so the bus manager can hold a `Vec<Box<dyn Worker>>`.

use crate::address::WorkerAddress;
use crate::envelope::Envelope;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A function the bus manager injects into each worker so it can publish
/// without knowing anything about the bus itself (§9 "Cyclic references").
pub type SendFn = Arc<dyn Fn(Envelope) -> futures::future::BoxFuture<'static, crate::Result<()>> + Send + Sync>;

/// Tracks readiness independently of the worker trait object, since `boot`
/// may run for the worker's entire lifetime (e.g. an IRC read loop).
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The worker contract from §4.1.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Family name, e.g. `"irc"`, `"gpt"`.
    fn name(&self) -> &str;

    /// Disambiguator, e.g. an IRC server hostname. Empty string if none.
    fn subname(&self) -> Option<String> {
        None
    }

    /// Start long-running resources. MAY block for the worker's lifetime
    /// (e.g. an IRC read loop lives inside `boot`). MUST call
    /// `readiness.set_ready()` once all preconditions are satisfied.
    async fn boot(&self, address: WorkerAddress, readiness: Readiness, send: SendFn) -> crate::Result<()>;

    /// Release resources; idempotent; causes any running `boot` to return.
    async fn shutdown(&self) -> crate::Result<()>;

    /// Process one inbound envelope. `true` (or any non-false outcome) means
    /// ack; `false` means do not ack, let the bus redeliver later (§4.1,
    /// §7 *BusTransient*).
    async fn receive(&self, subject: &str, envelope: Envelope) -> crate::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Worker for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn boot(&self, _address: WorkerAddress, readiness: Readiness, _send: SendFn) -> crate::Result<()> {
            readiness.set_ready();
            Ok(())
        }

        async fn shutdown(&self) -> crate::Result<()> {
            Ok(())
        }

        async fn receive(&self, _subject: &str, _envelope: Envelope) -> crate::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn readiness_flips_after_boot() {
        let readiness = Readiness::new();
        assert!(!readiness.is_ready());
        let worker = Noop;
        let send: SendFn = Arc::new(|_| Box::pin(async { Ok(()) }));
        worker
            .boot(
                WorkerAddress::new(crate::address::WorkerEnd::Backend, "noop", None),
                readiness.clone(),
                send,
            )
            .await
            .unwrap();
        assert!(readiness.is_ready());
    }
}
