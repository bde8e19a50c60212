use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use onerelay_common::{GlobalConfig, GlobalConfigPatch};
use onerelay_provider_core::{EventHub, TerminalEventSink};
use onerelay_provider_impl::{HttpImageLoader, builtin_registry};
use onerelay_storage::{DbEventSink, NewToken, NewUser, ROLE_ROOT, SeaOrmStorage, Storage};

use crate::health::HealthManager;
use crate::ledger::QuotaLedger;
use crate::locks::TopUpService;
use crate::relay::RelayEngine;
use crate::state::AppState;
use crate::sweep::ChannelTester;
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

/// Starting balance of the bootstrap root user.
const ROOT_INITIAL_QUOTA: i64 = 100_000_000;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "onerelay",
    version,
    about = "Multi-tenant LLM relay with channel failover and quota billing"
)]
pub struct CliArgs {
    /// Database DSN (required to bootstrap the rest of config).
    #[arg(long, env = "ONERELAY_DSN")]
    pub dsn: Option<String>,

    /// Bind host.
    #[arg(long, env = "ONERELAY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "ONERELAY_PORT")]
    pub port: Option<String>,

    /// Admin key (plaintext). Stored as hash in DB and memory.
    #[arg(long, env = "ONERELAY_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "ONERELAY_PROXY")]
    pub proxy: Option<String>,

    /// Print consume events on the terminal sink.
    #[arg(long, env = "ONERELAY_LOG_CONSUME_CONTENT")]
    pub log_consume_content: Option<String>,
}

pub struct Bootstrap {
    pub storage: Arc<dyn Storage>,
    pub state: Arc<AppState>,
    pub engine: Arc<RelayEngine>,
    pub tester: Arc<ChannelTester>,
    pub top_ups: Arc<TopUpService>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let dsn = sanitize_dsn_value(args.dsn.clone());
    let host = sanitize_optional_env_value(args.host.clone());
    let port = parse_u16_env_value(args.port.clone(), "ONERELAY_PORT")?;
    let admin_key = sanitize_optional_env_value(args.admin_key.clone());
    let proxy = sanitize_optional_env_value(args.proxy.clone());
    let log_consume_content =
        parse_bool_env_value(args.log_consume_content.clone(), "ONERELAY_LOG_CONSUME_CONTENT")?;

    ensure_sqlite_parent_dir(&dsn)?;

    // 1) connect DB from CLI/ENV DSN (required).
    let seaorm = SeaOrmStorage::connect(&dsn)
        .await
        .context("connect storage")?;
    seaorm.sync().await.context("schema sync")?;
    let storage: Arc<dyn Storage> = Arc::new(seaorm);

    // 2) merge once: CLI > ENV > DB (clap already orders CLI over ENV).
    let mut merged = storage
        .load_global_config()
        .await
        .context("load db global_config")?
        .map(|row| GlobalConfigPatch::from(row.config))
        .unwrap_or_default();

    let mut admin_key_hash_override = admin_key.as_deref().map(hash_admin_key);
    let mut generated_key = None;
    if admin_key_hash_override.is_none() && merged.admin_key_hash.is_none() {
        let key_plain = generate_admin_key();
        eprintln!("generated admin key: {key_plain}");
        admin_key_hash_override = Some(hash_admin_key(&key_plain));
        generated_key = Some(key_plain);
    }

    merged.overlay(GlobalConfigPatch {
        host,
        port,
        admin_key_hash: admin_key_hash_override,
        proxy,
        dsn: Some(dsn),
        log_consume_content,
        settings: None,
    });
    let global: GlobalConfig = merged
        .into_config()
        .context("finalize merged global config")?;

    // 3) persist merged global config back to DB.
    storage
        .upsert_global_config(&global)
        .await
        .context("upsert global_config")?;

    // 3.1) the admin key doubles as the root user's relay token.
    ensure_root_token(storage.as_ref(), &global.admin_key_hash)
        .await
        .context("bootstrap root token")?;
    if generated_key.is_some() {
        info!(event = "root_token_created");
    }

    // 4) load channels once; later reads come from the in-memory index.
    let snapshot = storage
        .load_channel_snapshot()
        .await
        .context("load channel snapshot")?;

    // 5) build in-memory state.
    let events = EventHub::new(1024);
    events
        .add_sink(Arc::new(TerminalEventSink::new(global.log_consume_content)))
        .await;
    events
        .add_sink(Arc::new(DbEventSink::new(storage.clone())))
        .await;

    let settings = global.settings.clone();
    let client_config = UpstreamClientConfig::from_global(&global);
    let state = Arc::new(AppState::from_bootstrap(global, &snapshot, events));

    let proxy_state = state.clone();
    let client = WreqUpstreamClient::new_with_proxy_resolver(client_config, move || {
        proxy_state.global.load().proxy.clone()
    })
    .context("build upstream client")?;
    let images = HttpImageLoader::new(Duration::from_secs(30)).context("build image loader")?;
    let registry = builtin_registry(Arc::new(images));

    let ledger = Arc::new(QuotaLedger::new(
        storage.clone(),
        settings.batch_update_enabled,
    ));
    if ledger.is_batched() {
        ledger.spawn_flusher(Duration::from_secs(settings.batch_update_interval_secs.max(1)));
    }
    let health = Arc::new(HealthManager::new(storage.clone(), state.clone()));
    let engine = Arc::new(RelayEngine::new(
        state.clone(),
        storage.clone(),
        registry,
        Arc::new(client),
        ledger,
        health,
    ));
    let tester = Arc::new(ChannelTester::new(engine.clone()));

    state.spawn_refresh(storage.clone());
    tester.spawn_auto_test();

    info!(
        event = "bootstrap_ready",
        channels = snapshot.channels.len(),
        abilities = snapshot.abilities.len(),
        batched_quota = settings.batch_update_enabled
    );

    Ok(Bootstrap {
        top_ups: Arc::new(TopUpService::new(storage.clone())),
        storage,
        state,
        engine,
        tester,
    })
}

async fn ensure_root_token(storage: &dyn Storage, key_hash: &str) -> anyhow::Result<()> {
    if storage.find_token_by_key_hash(key_hash).await?.is_some() {
        return Ok(());
    }
    let user_id = storage
        .insert_user(&NewUser {
            username: "root".to_string(),
            group: "default".to_string(),
            quota: ROOT_INITIAL_QUOTA,
            role: ROLE_ROOT,
        })
        .await?;
    storage
        .insert_token(&NewToken {
            user_id,
            name: "bootstrap".to_string(),
            key_hash: key_hash.to_string(),
            remain_quota: 0,
            unlimited_quota: true,
            model_limits: Vec::new(),
            group: None,
        })
        .await?;
    Ok(())
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Unresolved `${VAR}` placeholders from PaaS templates count as unset.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn sanitize_dsn_value(value: Option<String>) -> String {
    sanitize_optional_env_value(value).unwrap_or_else(default_dsn)
}

fn default_dsn() -> String {
    if let Some(data_dir) = sanitize_optional_env_value(std::env::var("ONERELAY_DATA_DIR").ok()) {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/onerelay.db?mode=rwc");
    }
    "sqlite://onerelay.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    let normalized = path_part.strip_prefix("//").unwrap_or(path_part);
    if normalized.is_empty() || normalized.eq_ignore_ascii_case(":memory:") {
        return None;
    }
    Some(PathBuf::from(normalized))
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u16>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}

pub fn hash_admin_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

fn generate_admin_key() -> String {
    format!("sk-{}", uuid::Uuid::new_v4().simple())
}
