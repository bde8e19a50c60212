use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use onerelay_common::{GlobalConfig, KeywordMatcher, RelaySettings};
use onerelay_provider_core::EventHub;
use onerelay_storage::{ChannelSnapshot, Storage, StorageResult};

use crate::filter::SensitiveFilter;
use crate::selector::ChannelIndex;

/// Shared runtime state.
///
/// Every field is swapped whole; a request loads each value once and keeps
/// reading that version until it finishes.
pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub channels: ArcSwap<ChannelIndex>,
    /// Health keywords, rebuilt with the global config.
    pub keywords: ArcSwap<KeywordMatcher>,
    pub filter: ArcSwap<SensitiveFilter>,
    pub events: EventHub,
}

impl AppState {
    pub fn from_bootstrap(
        global: GlobalConfig,
        snapshot: &ChannelSnapshot,
        events: EventHub,
    ) -> Self {
        let keywords = KeywordMatcher::new(&global.settings.disable_keywords);
        let filter = SensitiveFilter::from_settings(&global.settings.filter);
        Self {
            channels: ArcSwap::from_pointee(ChannelIndex::build(snapshot)),
            keywords: ArcSwap::from_pointee(keywords),
            filter: ArcSwap::from_pointee(filter),
            global: ArcSwap::from_pointee(global),
            events,
        }
    }

    pub fn settings(&self) -> RelaySettings {
        self.global.load().settings.clone()
    }

    pub fn apply_global_config(&self, config: GlobalConfig) {
        self.keywords
            .store(Arc::new(KeywordMatcher::new(&config.settings.disable_keywords)));
        self.filter
            .store(Arc::new(SensitiveFilter::from_settings(&config.settings.filter)));
        self.global.store(Arc::new(config));
    }

    pub fn apply_channel_snapshot(&self, snapshot: &ChannelSnapshot) {
        let index = ChannelIndex::build(snapshot);
        debug!(
            event = "channel_index_swapped",
            channels = index.channel_count(),
            abilities = snapshot.abilities.len()
        );
        self.channels.store(Arc::new(index));
    }

    /// Reloads channels and abilities from storage and swaps the index.
    pub async fn refresh_channels(&self, storage: &dyn Storage) -> StorageResult<()> {
        let snapshot = storage.load_channel_snapshot().await?;
        self.apply_channel_snapshot(&snapshot);
        Ok(())
    }

    /// Periodic snapshot refresh; the first reload happens one period after start.
    pub fn spawn_refresh(self: &Arc<Self>, storage: Arc<dyn Storage>) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            loop {
                let every = state.global.load().settings.sync_frequency_secs.max(1);
                tokio::time::sleep(Duration::from_secs(every)).await;
                if let Err(err) = state.refresh_channels(storage.as_ref()).await {
                    warn!(event = "channel_refresh_failed", error = %err);
                }
            }
        })
    }
}
