use serde::de::DeserializeOwned;
use serde_json::Value;

use onerelay_provider_core::{Ability, Channel, ChannelStatus, ChannelType};
use sea_orm::ActiveValue;

use crate::entities;
use crate::snapshot::{TokenRow, TopUpRow, TopUpStatus, UserRow};
use crate::storage::StorageResult;

fn json_or_default<T: DeserializeOwned + Default>(value: Value) -> StorageResult<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value)?)
}

pub(super) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub(super) fn channel_from_model(m: entities::channels::Model) -> StorageResult<Channel> {
    Ok(Channel {
        id: m.id,
        name: m.name,
        channel_type: ChannelType::from(m.channel_type),
        key: m.key,
        base_url: m.base_url,
        models: split_list(&m.models),
        groups: split_list(&m.groups),
        status: ChannelStatus::try_from(m.status).unwrap_or(ChannelStatus::ManuallyDisabled),
        priority: m.priority,
        weight: u32::try_from(m.weight).unwrap_or(0),
        tag: m.tag.filter(|tag| !tag.is_empty()),
        auto_ban: m.auto_ban,
        test_model: m.test_model,
        model_mapping: json_or_default(m.model_mapping)?,
        other: m.other,
        organization: m.organization,
        settings: json_or_default(m.settings)?,
        param_override: json_or_default(m.param_override)?,
        header_override: json_or_default(m.header_override)?,
        response_time_ms: m.response_time_ms,
        test_time: m.test_time,
        used_quota: m.used_quota,
        created_at: m.created_at.unix_timestamp(),
    })
}

/// Writable columns of a channel; id, timings and created_at are left to the caller.
pub(super) fn channel_active(channel: &Channel) -> StorageResult<entities::channels::ActiveModel> {
    Ok(entities::channels::ActiveModel {
        id: ActiveValue::NotSet,
        name: ActiveValue::Set(channel.name.clone()),
        channel_type: ActiveValue::Set(channel.channel_type.as_i32()),
        key: ActiveValue::Set(channel.key.clone()),
        base_url: ActiveValue::Set(channel.base_url.clone()),
        models: ActiveValue::Set(channel.model_list().join(",")),
        groups: ActiveValue::Set(channel.group_list().join(",")),
        status: ActiveValue::Set(channel.status.as_i32()),
        priority: ActiveValue::Set(channel.priority),
        weight: ActiveValue::Set(i32::try_from(channel.weight).unwrap_or(i32::MAX)),
        tag: ActiveValue::Set(channel.tag.clone().filter(|tag| !tag.is_empty())),
        auto_ban: ActiveValue::Set(channel.auto_ban),
        test_model: ActiveValue::Set(channel.test_model.clone()),
        model_mapping: ActiveValue::Set(serde_json::to_value(&channel.model_mapping)?),
        other: ActiveValue::Set(channel.other.clone()),
        organization: ActiveValue::Set(channel.organization.clone()),
        settings: ActiveValue::Set(Value::Object(channel.settings.clone())),
        param_override: ActiveValue::Set(Value::Object(channel.param_override.clone())),
        header_override: ActiveValue::Set(serde_json::to_value(&channel.header_override)?),
        response_time_ms: ActiveValue::NotSet,
        test_time: ActiveValue::NotSet,
        used_quota: ActiveValue::NotSet,
        created_at: ActiveValue::NotSet,
    })
}

pub(super) fn ability_from_model(m: entities::abilities::Model) -> Ability {
    Ability {
        group: m.group,
        model: m.model,
        channel_id: m.channel_id,
        enabled: m.enabled,
        priority: m.priority,
        weight: u32::try_from(m.weight).unwrap_or(0),
        tag: m.tag.filter(|tag| !tag.is_empty()),
    }
}

pub(super) fn ability_active(ability: Ability) -> entities::abilities::ActiveModel {
    entities::abilities::ActiveModel {
        group: ActiveValue::Set(ability.group),
        model: ActiveValue::Set(ability.model),
        channel_id: ActiveValue::Set(ability.channel_id),
        enabled: ActiveValue::Set(ability.enabled),
        priority: ActiveValue::Set(ability.priority),
        weight: ActiveValue::Set(i32::try_from(ability.weight).unwrap_or(i32::MAX)),
        tag: ActiveValue::Set(ability.tag),
    }
}

pub(super) fn user_from_model(m: entities::users::Model) -> UserRow {
    UserRow {
        id: m.id,
        username: m.username,
        group: m.group,
        quota: m.quota,
        used_quota: m.used_quota,
        request_count: m.request_count,
        role: m.role,
        enabled: m.enabled,
    }
}

pub(super) fn token_from_model(m: entities::tokens::Model) -> TokenRow {
    TokenRow {
        id: m.id,
        user_id: m.user_id,
        name: m.name,
        key_hash: m.key_hash,
        enabled: m.enabled,
        remain_quota: m.remain_quota,
        unlimited_quota: m.unlimited_quota,
        used_quota: m.used_quota,
        model_limits: m.model_limits.as_deref().map(split_list).unwrap_or_default(),
        group: m.group.filter(|group| !group.is_empty()),
    }
}

pub(super) fn top_up_from_model(m: entities::top_ups::Model) -> TopUpRow {
    TopUpRow {
        id: m.id,
        user_id: m.user_id,
        trade_no: m.trade_no,
        amount: m.amount,
        status: TopUpStatus::parse(&m.status),
        created_at: m.created_at,
        completed_at: m.completed_at,
    }
}
