use std::collections::HashMap;
use std::sync::Arc;

use crate::adaptor::Adaptor;
use crate::channel::ChannelType;

/// Channel type → adaptor lookup, built once at startup.
#[derive(Default, Clone)]
pub struct AdaptorRegistry {
    adaptors: HashMap<ChannelType, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, types: &[ChannelType], adaptor: Arc<dyn Adaptor>) {
        for channel_type in types {
            self.adaptors.insert(*channel_type, adaptor.clone());
        }
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn Adaptor>> {
        self.adaptors.get(&channel_type).cloned()
    }

    pub fn supports(&self, channel_type: ChannelType) -> bool {
        self.adaptors.contains_key(&channel_type)
    }
}
