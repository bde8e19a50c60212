mod config;
pub mod keyword;
mod settings;

pub use config::{GlobalConfig, GlobalConfigError, GlobalConfigPatch};
pub use keyword::{KeywordMatch, KeywordMatcher};
pub use settings::{
    FilterDictionary, FilterSettings, RatioTables, RelaySettings, DEFAULT_DISABLE_KEYWORDS,
};
