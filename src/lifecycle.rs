//! Process lifecycle: boot the change feed once, tear everything down on
//! termination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;

use crate::registry::ClientRegistry;
use crate::subscriber::ChangeFeedSubscriber;

pub struct Lifecycle {
    subscriber: Arc<ChangeFeedSubscriber>,
    registry: ClientRegistry,
    change_feed_enabled: bool,
    booted: AtomicBool,
}

impl Lifecycle {
    pub fn new(
        subscriber: Arc<ChangeFeedSubscriber>,
        registry: ClientRegistry,
        change_feed_enabled: bool,
    ) -> Self {
        Self {
            subscriber,
            registry,
            change_feed_enabled,
            booted: AtomicBool::new(false),
        }
    }

    /// Starts the change-feed subscription exactly once per process.
    ///
    /// Deployment modes without a guaranteed-live background process must
    /// not own a standing subscription, so the start is skipped entirely
    /// there. Repeated boot attempts (e.g. request-triggered lazy
    /// initialization) hit the guard and return without effect. A failed
    /// initial subscribe is an unrecoverable startup error.
    pub async fn boot(&self) -> anyhow::Result<()> {
        if !self.change_feed_enabled {
            tracing::info!("change feed disabled for this deployment mode; skipping subscription");
            return Ok(());
        }
        if self.booted.swap(true, Ordering::SeqCst) {
            tracing::debug!("boot already ran; skipping");
            return Ok(());
        }
        self.subscriber
            .start()
            .await
            .context("failed to open the change feed subscription")?;
        Ok(())
    }

    /// Closes the subscription, then clears the registry, in that order.
    /// Blocks until both complete. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.subscriber.stop().await;
        self.registry.clear();
        tracing::info!("shutdown complete; all streaming clients released");
    }
}
