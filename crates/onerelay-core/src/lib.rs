pub mod bootstrap;
pub mod filter;
pub mod health;
pub mod ledger;
pub mod locks;
pub mod pricing;
pub mod relay;
pub mod selector;
pub mod state;
pub mod sweep;
pub mod upstream_client;

pub use bootstrap::{Bootstrap, CliArgs, bootstrap, bootstrap_from_env, hash_admin_key};
pub use filter::{FilterAction, FilterResult, SensitiveFilter};
pub use health::HealthManager;
pub use ledger::QuotaLedger;
pub use locks::{KeyedLocks, TopUpOutcome, TopUpService};
pub use relay::{Caller, RelayEngine, RelayRequest, RelayResponse};
pub use selector::ChannelIndex;
pub use state::AppState;
pub use sweep::{ChannelTester, ProbeOutcome, SweepError};
pub use upstream_client::{UpstreamClientConfig, WreqUpstreamClient};
