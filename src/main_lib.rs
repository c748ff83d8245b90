use std::sync::Arc;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    config::Config,
    dispatch::Dispatcher,
    lifecycle::Lifecycle,
    registry::ClientRegistry,
    source::{ChangeFeedPublisher, ChannelChangeSource},
    subscriber::ChangeFeedSubscriber,
};

pub struct AppState {
    pub registry: ClientRegistry,
    /// Write-path handle: the host application publishes a change record
    /// here after each successful write to the watched collection.
    pub change_feed: ChangeFeedPublisher,
    pub subscriber: Arc<ChangeFeedSubscriber>,
    pub lifecycle: Lifecycle,
}

pub fn init_tracing() {
    let fmt_layer = fmt::layer().json().with_current_span(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

pub fn build_state(config: &Config) -> Arc<AppState> {
    let registry = ClientRegistry::new();
    let source = Arc::new(ChannelChangeSource::new(config.change_feed_capacity));
    let change_feed = source.publisher();
    let dispatcher = Dispatcher::new(registry.clone());
    let subscriber = Arc::new(ChangeFeedSubscriber::new(
        source,
        dispatcher,
        config.change_feed_retry,
    ));
    let lifecycle = Lifecycle::new(
        subscriber.clone(),
        registry.clone(),
        config.change_feed_enabled,
    );

    Arc::new(AppState {
        registry,
        change_feed,
        subscriber,
        lifecycle,
    })
}
