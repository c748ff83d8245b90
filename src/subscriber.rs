//! The single change-feed consumer owned by the process.
//!
//! One task drains the change-notification stream, normalizes each record
//! and hands the result to the dispatcher. Malformed records and per-sink
//! write failures are contained here; nothing in the fan-out path can take
//! the subscription down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt as _;

use crate::dispatch::Dispatcher;
use crate::events::DomainEvent;
use crate::source::{ChangeSource, ChangeStream, SourceError};

/// Observable lifecycle of the change-feed subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedState {
    Stopped,
    Starting,
    Watching,
    /// The source reported an error; the feed is degraded until the
    /// transport recovers, a configured retry re-opens it, or the process
    /// restarts.
    Error,
    /// The source closed its side of the stream.
    Ended,
}

struct FeedTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the process-wide subscription against the change-notification
/// source, including its open/error/end/close lifecycle.
pub struct ChangeFeedSubscriber {
    source: Arc<dyn ChangeSource>,
    dispatcher: Dispatcher,
    retry: Option<Duration>,
    state: Arc<Mutex<FeedState>>,
    task: tokio::sync::Mutex<Option<FeedTask>>,
}

impl ChangeFeedSubscriber {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        dispatcher: Dispatcher,
        retry: Option<Duration>,
    ) -> Self {
        Self {
            source,
            dispatcher,
            retry,
            state: Arc::new(Mutex::new(FeedState::Stopped)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> FeedState {
        *self.state.lock().unwrap()
    }

    /// Opens the subscription and spawns the consumer task.
    ///
    /// Calling `start` while a subscription task already exists is a no-op.
    /// A failed initial subscribe is returned to the caller; nothing is
    /// spawned in that case.
    pub async fn start(&self) -> Result<(), SourceError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            tracing::debug!("change feed already running; start ignored");
            return Ok(());
        }

        set_state(&self.state, FeedState::Starting);
        let stream = match self.source.subscribe().await {
            Ok(stream) => stream,
            Err(err) => {
                set_state(&self.state, FeedState::Stopped);
                return Err(err);
            }
        };
        set_state(&self.state, FeedState::Watching);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(watch_loop(
            stream,
            self.source.clone(),
            self.dispatcher.clone(),
            self.retry,
            self.state.clone(),
            shutdown_rx,
        ));
        *task = Some(FeedTask {
            shutdown: shutdown_tx,
            handle,
        });
        tracing::info!("change feed subscription opened");
        Ok(())
    }

    /// Closes the subscription, waiting for the consumer task to finish.
    /// A no-op when the feed was never started or is already stopped.
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        let Some(task) = task else {
            return;
        };
        let _ = task.shutdown.send(true);
        if let Err(err) = task.handle.await {
            tracing::warn!("change feed task did not shut down cleanly: {err}");
        }
        set_state(&self.state, FeedState::Stopped);
        tracing::info!("change feed subscription closed");
    }
}

fn set_state(state: &Mutex<FeedState>, next: FeedState) {
    *state.lock().unwrap() = next;
}

async fn watch_loop(
    mut stream: ChangeStream,
    source: Arc<dyn ChangeSource>,
    dispatcher: Dispatcher,
    retry: Option<Duration>,
    state: Arc<Mutex<FeedState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = stream.next() => match next {
                Some(Ok(record)) => {
                    if *state.lock().unwrap() == FeedState::Error {
                        // The transport recovered on its own.
                        tracing::info!("change feed recovered");
                        set_state(&state, FeedState::Watching);
                    }
                    match DomainEvent::from_record(record) {
                        Ok(event) => dispatcher.dispatch(&event),
                        Err(err) => tracing::warn!("skipping malformed change record: {err}"),
                    }
                }
                Some(Err(err)) => {
                    tracing::error!("change feed error: {err}");
                    set_state(&state, FeedState::Error);
                    if let Some(delay) = retry {
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        match source.subscribe().await {
                            Ok(next_stream) => {
                                stream = next_stream;
                                set_state(&state, FeedState::Watching);
                                tracing::info!("change feed re-opened after error");
                            }
                            Err(err) => {
                                tracing::error!("change feed re-subscribe failed: {err}");
                            }
                        }
                    }
                    // Without a retry policy the degraded stream keeps being
                    // polled; it either self-recovers or stays quiet until
                    // the process restarts.
                }
                None => {
                    tracing::warn!("change feed ended by the source");
                    set_state(&state, FeedState::Ended);
                    let _ = shutdown.changed().await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::registry::{ClientRegistry, CollectingSink};
    use crate::source::{ChangeRecord, ChannelChangeSource};

    /// Source that replays one scripted item list per `subscribe` call.
    struct ScriptedSource {
        scripts: Mutex<Vec<Vec<Result<ChangeRecord, SourceError>>>>,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<Vec<Result<ChangeRecord, SourceError>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
            }
        }
    }

    #[async_trait]
    impl ChangeSource for ScriptedSource {
        async fn subscribe(&self) -> Result<ChangeStream, SourceError> {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                return Err(SourceError::Transport("no more subscriptions".into()));
            }
            Ok(futures::stream::iter(scripts.remove(0)).boxed())
        }
    }

    fn record(tenant: &str) -> ChangeRecord {
        ChangeRecord::insert(json!({ "_id": "act-1", "organizationId": tenant }))
    }

    fn subscriber_over(
        source: Arc<dyn ChangeSource>,
        retry: Option<Duration>,
    ) -> (ChangeFeedSubscriber, ClientRegistry) {
        let registry = ClientRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());
        (ChangeFeedSubscriber::new(source, dispatcher, retry), registry)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn dispatches_records_and_ends_with_the_source() {
        let source = Arc::new(ScriptedSource::new(vec![vec![Ok(record("org-1"))]]));
        let (subscriber, registry) = subscriber_over(source, None);
        let sink = CollectingSink::new();
        registry.register("org-1", Arc::new(sink.clone())).unwrap();

        assert_eq!(subscriber.state(), FeedState::Stopped);
        subscriber.start().await.unwrap();

        wait_until(|| sink.len() == 1).await;
        wait_until(|| subscriber.state() == FeedState::Ended).await;

        subscriber.stop().await;
        assert_eq!(subscriber.state(), FeedState::Stopped);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_not_fatal() {
        let source = Arc::new(ScriptedSource::new(vec![vec![
            Ok(ChangeRecord::new("delete", json!({ "_id": "gone" }))),
            Ok(record("org-1")),
        ]]));
        let (subscriber, registry) = subscriber_over(source, None);
        let sink = CollectingSink::new();
        registry.register("org-1", Arc::new(sink.clone())).unwrap();

        subscriber.start().await.unwrap();
        wait_until(|| sink.len() == 1).await;
        subscriber.stop().await;
    }

    #[tokio::test]
    async fn source_error_degrades_without_exiting() {
        let source = Arc::new(ScriptedSource::new(vec![vec![
            Err(SourceError::Transport("connection reset".into())),
            Ok(record("org-1")),
        ]]));
        let (subscriber, registry) = subscriber_over(source, None);
        let sink = CollectingSink::new();
        registry.register("org-1", Arc::new(sink.clone())).unwrap();

        subscriber.start().await.unwrap();

        // The degraded stream keeps being polled and self-recovers here.
        wait_until(|| sink.len() == 1).await;
        subscriber.stop().await;
        assert_eq!(subscriber.state(), FeedState::Stopped);
    }

    #[tokio::test]
    async fn error_state_is_observable_while_degraded() {
        struct DegradedSource;

        #[async_trait]
        impl ChangeSource for DegradedSource {
            async fn subscribe(&self) -> Result<ChangeStream, SourceError> {
                // One error, then silence: degraded but still open.
                Ok(futures::stream::select(
                    futures::stream::iter(vec![Err(SourceError::Transport(
                        "connection reset".into(),
                    ))]),
                    futures::stream::pending(),
                )
                .boxed())
            }
        }

        let (subscriber, _registry) = subscriber_over(Arc::new(DegradedSource), None);
        subscriber.start().await.unwrap();

        wait_until(|| subscriber.state() == FeedState::Error).await;

        subscriber.stop().await;
        assert_eq!(subscriber.state(), FeedState::Stopped);
    }

    #[tokio::test]
    async fn configured_retry_reopens_the_subscription() {
        let source = Arc::new(ScriptedSource::new(vec![
            vec![Err(SourceError::Transport("connection reset".into()))],
            vec![Ok(record("org-1"))],
        ]));
        let (subscriber, registry) = subscriber_over(source, Some(Duration::from_millis(10)));
        let sink = CollectingSink::new();
        registry.register("org-1", Arc::new(sink.clone())).unwrap();

        subscriber.start().await.unwrap();
        wait_until(|| sink.len() == 1).await;
        subscriber.stop().await;
    }

    #[tokio::test]
    async fn failed_initial_subscribe_is_returned_to_the_caller() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let (subscriber, _registry) = subscriber_over(source, None);

        let err = subscriber.start().await.unwrap_err();
        assert!(matches!(err, SourceError::Transport(_)));
        assert_eq!(subscriber.state(), FeedState::Stopped);
    }

    #[tokio::test]
    async fn start_while_watching_is_a_noop() {
        let source = Arc::new(ChannelChangeSource::new(8));
        let (subscriber, _registry) = subscriber_over(source, None);

        subscriber.start().await.unwrap();
        assert_eq!(subscriber.state(), FeedState::Watching);
        subscriber.start().await.unwrap();
        assert_eq!(subscriber.state(), FeedState::Watching);

        subscriber.stop().await;
        assert_eq!(subscriber.state(), FeedState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let source = Arc::new(ChannelChangeSource::new(8));
        let (subscriber, _registry) = subscriber_over(source, None);

        subscriber.stop().await;
        assert_eq!(subscriber.state(), FeedState::Stopped);

        subscriber.start().await.unwrap();
        subscriber.stop().await;
        subscriber.stop().await;
        assert_eq!(subscriber.state(), FeedState::Stopped);
    }
}
