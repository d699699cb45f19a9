//! Runtime bootstrap: settings, logging and metric descriptions.

pub mod error;
pub mod telemetry;

use std::path::Path;

use tracing::info;

use crate::cache::{ClientConfig, PrefetchConfig, PrefetchQueue, QueryClient};
use crate::config::{self, Settings};

use self::error::InfraError;

/// A configured client together with its prefetch queue.
#[derive(Debug)]
pub struct Runtime {
    pub settings: Settings,
    pub client: QueryClient,
    pub prefetch: PrefetchQueue,
}

/// Load settings, install the tracing subscriber and build the client.
///
/// Call once per process; a second call fails because the global subscriber
/// is already installed.
pub fn bootstrap(config_file: Option<&Path>) -> Result<Runtime, InfraError> {
    let settings = config::load(config_file)?;
    telemetry::init(&settings.logging)?;

    let client = QueryClient::new(ClientConfig::from(&settings.query));
    let prefetch = PrefetchQueue::new(client.clone(), PrefetchConfig::from(&settings.prefetch));

    info!(
        stale_time_ms = settings.query.stale_time.as_millis() as u64,
        gc_time_ms = settings.query.gc_time.as_millis() as u64,
        prefetch_concurrency = settings.prefetch.concurrency.get(),
        "Query cache ready"
    );

    Ok(Runtime {
        settings,
        client,
        prefetch,
    })
}
