use std::collections::HashMap;

use sea_orm::{ActiveValue, ColumnTrait, EntityTrait, QueryFilter};

use onerelay_provider_core::{Channel, ChannelStatus, ChannelType};
use onerelay_storage::{ABILITY_BATCH, SeaOrmStorage, Storage, TagUpdate, entities};

async fn storage() -> SeaOrmStorage {
    let storage = SeaOrmStorage::connect("sqlite::memory:").await.unwrap();
    storage.sync().await.unwrap();
    storage
}

fn channel(name: &str, models: &[&str], groups: &[&str]) -> Channel {
    let mut channel = Channel::new(0, name, ChannelType::OpenAI);
    channel.key = "sk-test".to_string();
    channel.models = models.iter().map(|m| m.to_string()).collect();
    channel.groups = groups.iter().map(|g| g.to_string()).collect();
    channel
}

fn per_channel(abilities: &[onerelay_provider_core::Ability]) -> HashMap<i64, usize> {
    let mut counts = HashMap::new();
    for ability in abilities {
        *counts.entry(ability.channel_id).or_insert(0) += 1;
    }
    counts
}

#[tokio::test]
async fn insert_writes_models_times_groups() {
    let storage = storage().await;
    let mut c = channel("a", &["gpt-4o", "gpt-4o-mini", "o3"], &["default", "vip"]);
    c.priority = 3;
    c.weight = 7;
    c.tag = Some("east".to_string());
    let id = storage.insert_channel(&c).await.unwrap();

    let abilities = storage.list_abilities().await.unwrap();
    assert_eq!(abilities.len(), 6);
    assert!(abilities.iter().all(|a| a.channel_id == id
        && a.priority == 3
        && a.weight == 7
        && a.enabled
        && a.tag.as_deref() == Some("east")));

    let loaded = storage.get_channel(id).await.unwrap().unwrap();
    assert_eq!(loaded.models, vec!["gpt-4o", "gpt-4o-mini", "o3"]);
    assert_eq!(loaded.key, "sk-test");
}

#[tokio::test]
async fn large_channels_are_written_in_batches() {
    let storage = storage().await;
    let models: Vec<String> = (0..ABILITY_BATCH + 7).map(|i| format!("m-{i}")).collect();
    let model_refs: Vec<&str> = models.iter().map(String::as_str).collect();
    let id = storage
        .insert_channel(&channel("big", &model_refs, &["default", "vip"]))
        .await
        .unwrap();
    let abilities = storage.list_abilities().await.unwrap();
    assert_eq!(per_channel(&abilities)[&id], (ABILITY_BATCH + 7) * 2);
}

#[tokio::test]
async fn update_regenerates_instead_of_patching() {
    let storage = storage().await;
    let id = storage
        .insert_channel(&channel("a", &["m1", "m2"], &["default"]))
        .await
        .unwrap();
    let mut updated = storage.get_channel(id).await.unwrap().unwrap();
    updated.models = vec!["m3".to_string()];
    updated.groups = vec!["default".to_string(), "vip".to_string()];
    storage.update_channel(&updated).await.unwrap();

    let abilities = storage.list_abilities().await.unwrap();
    assert_eq!(abilities.len(), 2);
    assert!(abilities.iter().all(|a| a.model == "m3"));
}

#[tokio::test]
async fn status_changes_flow_to_abilities() {
    let storage = storage().await;
    let id = storage
        .insert_channel(&channel("a", &["m1"], &["default", "vip"]))
        .await
        .unwrap();
    storage
        .set_channel_status(id, ChannelStatus::AutoDisabled)
        .await
        .unwrap();
    assert!(storage.list_abilities().await.unwrap().iter().all(|a| !a.enabled));
    let loaded = storage.get_channel(id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ChannelStatus::AutoDisabled);

    assert!(storage
        .set_channel_status(9999, ChannelStatus::Enabled)
        .await
        .is_err());
}

#[tokio::test]
async fn tag_operations_touch_channels_and_abilities() {
    let storage = storage().await;
    let mut tagged = channel("t1", &["m1"], &["default"]);
    tagged.tag = Some("batch".to_string());
    let t1 = storage.insert_channel(&tagged).await.unwrap();
    let t2 = storage.insert_channel(&tagged).await.unwrap();
    let other = storage
        .insert_channel(&channel("plain", &["m1"], &["default"]))
        .await
        .unwrap();

    let changed = storage
        .set_status_by_tag("batch", ChannelStatus::ManuallyDisabled)
        .await
        .unwrap();
    assert_eq!(changed, 2);
    let abilities = storage.list_abilities().await.unwrap();
    for ability in &abilities {
        assert_eq!(ability.enabled, ability.channel_id == other);
    }

    let changed = storage
        .update_channels_by_tag(
            "batch",
            &TagUpdate {
                new_tag: Some("renamed".to_string()),
                priority: Some(9),
                weight: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(changed, 2);
    for id in [t1, t2] {
        let loaded = storage.get_channel(id).await.unwrap().unwrap();
        assert_eq!(loaded.tag.as_deref(), Some("renamed"));
        assert_eq!(loaded.priority, 9);
    }
    let abilities = storage.list_abilities().await.unwrap();
    assert!(abilities
        .iter()
        .filter(|a| a.channel_id != other)
        .all(|a| a.priority == 9 && a.tag.as_deref() == Some("renamed")));
}

#[tokio::test]
async fn repair_removes_orphans_and_restores_missing_rows() {
    let storage = storage().await;
    let a = storage
        .insert_channel(&channel("a", &["m1", "m2"], &["default", "vip"]))
        .await
        .unwrap();
    let b = storage
        .insert_channel(&channel("b", &["m1"], &["default"]))
        .await
        .unwrap();
    let db = storage.connection();

    // Lose channel a's rows, leave rows behind for a channel that no longer exists,
    // and change b's model list without regenerating.
    entities::Abilities::delete_many()
        .filter(entities::abilities::Column::ChannelId.eq(a))
        .exec(db)
        .await
        .unwrap();
    entities::Abilities::insert(entities::abilities::ActiveModel {
        group: ActiveValue::Set("default".to_string()),
        model: ActiveValue::Set("ghost".to_string()),
        channel_id: ActiveValue::Set(4242),
        enabled: ActiveValue::Set(true),
        priority: ActiveValue::Set(0),
        weight: ActiveValue::Set(0),
        tag: ActiveValue::Set(None),
    })
    .exec_without_returning(db)
    .await
    .unwrap();
    entities::Channels::update_many()
        .col_expr(
            entities::channels::Column::Models,
            sea_orm::sea_query::Expr::value("m1,m3"),
        )
        .filter(entities::channels::Column::Id.eq(b))
        .exec(db)
        .await
        .unwrap();

    let fixed = storage.fix_abilities().await.unwrap();
    assert_eq!(fixed, 3);

    let counts = per_channel(&storage.list_abilities().await.unwrap());
    assert_eq!(counts.get(&a), Some(&4));
    assert_eq!(counts.get(&b), Some(&2));
    assert!(!counts.contains_key(&4242));

    assert_eq!(storage.fix_abilities().await.unwrap(), 0);
}

#[tokio::test]
async fn delete_channel_drops_its_abilities() {
    let storage = storage().await;
    let id = storage
        .insert_channel(&channel("a", &["m1"], &["default"]))
        .await
        .unwrap();
    storage.delete_channel(id).await.unwrap();
    assert!(storage.get_channel(id).await.unwrap().is_none());
    assert!(storage.list_abilities().await.unwrap().is_empty());
}
