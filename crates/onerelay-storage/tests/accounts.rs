use time::OffsetDateTime;

use onerelay_common::GlobalConfig;
use onerelay_storage::{
    LogKind, LogRecord, NewToken, NewUser, QuotaField, ROLE_COMMON, SeaOrmStorage, Storage,
    TopUpStatus,
};

async fn storage() -> SeaOrmStorage {
    let storage = SeaOrmStorage::connect("sqlite::memory:").await.unwrap();
    storage.sync().await.unwrap();
    storage
}

async fn user_with_token(storage: &SeaOrmStorage) -> (i64, i64) {
    let user_id = storage
        .insert_user(&NewUser {
            username: "alice".to_string(),
            group: "default".to_string(),
            quota: 10_000,
            role: ROLE_COMMON,
        })
        .await
        .unwrap();
    let token_id = storage
        .insert_token(&NewToken {
            user_id,
            name: "ci".to_string(),
            key_hash: "hash-1".to_string(),
            remain_quota: 5_000,
            unlimited_quota: false,
            model_limits: vec!["gpt-4o".to_string()],
            group: None,
        })
        .await
        .unwrap();
    (user_id, token_id)
}

#[tokio::test]
async fn global_config_round_trips_with_settings() {
    let storage = storage().await;
    assert!(storage.load_global_config().await.unwrap().is_none());

    let mut config = GlobalConfig {
        host: "127.0.0.1".to_string(),
        port: 3000,
        admin_key_hash: "h".to_string(),
        proxy: None,
        dsn: "sqlite::memory:".to_string(),
        log_consume_content: false,
        settings: Default::default(),
    };
    config.settings.retry_times = 4;
    storage.upsert_global_config(&config).await.unwrap();
    config.port = 3100;
    storage.upsert_global_config(&config).await.unwrap();

    let row = storage.load_global_config().await.unwrap().unwrap();
    assert_eq!(row.config.port, 3100);
    assert_eq!(row.config.settings.retry_times, 4);
}

#[tokio::test]
async fn token_lookup_by_hash() {
    let storage = storage().await;
    let (user_id, token_id) = user_with_token(&storage).await;
    let token = storage.find_token_by_key_hash("hash-1").await.unwrap().unwrap();
    assert_eq!(token.id, token_id);
    assert_eq!(token.user_id, user_id);
    assert!(token.allows_model("gpt-4o"));
    assert!(!token.allows_model("o3"));
    assert!(storage.find_token_by_key_hash("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn quota_deltas_move_balances() {
    let storage = storage().await;
    let (user_id, token_id) = user_with_token(&storage).await;

    storage.apply_quota_delta(QuotaField::UserQuota, user_id, 300).await.unwrap();
    storage.apply_quota_delta(QuotaField::UserQuota, user_id, -100).await.unwrap();
    storage.apply_quota_delta(QuotaField::UserUsedQuota, user_id, 200).await.unwrap();
    storage.apply_quota_delta(QuotaField::UserRequestCount, user_id, 1).await.unwrap();
    storage.apply_quota_delta(QuotaField::TokenQuota, token_id, 200).await.unwrap();

    let user = storage.get_user(user_id).await.unwrap().unwrap();
    assert_eq!(user.quota, 9_800);
    assert_eq!(user.used_quota, 200);
    assert_eq!(user.request_count, 1);
    let token = storage.get_token(token_id).await.unwrap().unwrap();
    assert_eq!(token.remain_quota, 4_800);
    assert_eq!(token.used_quota, 200);

    storage.apply_quota_delta(QuotaField::TokenUsedQuota, token_id, 50).await.unwrap();
    let token = storage.get_token(token_id).await.unwrap().unwrap();
    assert_eq!(token.remain_quota, 4_800);
    assert_eq!(token.used_quota, 250);
}

#[tokio::test]
async fn logs_append() {
    let storage = storage().await;
    let (user_id, token_id) = user_with_token(&storage).await;
    storage
        .append_log(&LogRecord {
            created_at: OffsetDateTime::now_utc(),
            kind: LogKind::Consume,
            user_id,
            token_id,
            channel_id: 1,
            model_name: "gpt-4o".to_string(),
            group: "default".to_string(),
            prompt_tokens: 100,
            completion_tokens: 50,
            quota: 450,
            use_time_ms: 820,
            is_stream: true,
            content: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(storage.count_logs(user_id).await.unwrap(), 1);
}

#[tokio::test]
async fn top_up_completes_once() {
    let storage = storage().await;
    let (user_id, _) = user_with_token(&storage).await;
    storage.insert_top_up(user_id, "T-1", 2_000).await.unwrap();

    assert!(storage.complete_top_up("T-1").await.unwrap());
    assert!(!storage.complete_top_up("T-1").await.unwrap());
    assert!(storage.complete_top_up("T-404").await.is_err());

    let row = storage.find_top_up("T-1").await.unwrap().unwrap();
    assert_eq!(row.status, TopUpStatus::Success);
    assert!(row.completed_at.is_some());
    let user = storage.get_user(user_id).await.unwrap().unwrap();
    assert_eq!(user.quota, 12_000);
}
