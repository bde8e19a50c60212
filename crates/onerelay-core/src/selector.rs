//! In-memory capability index and channel selection.
//!
//! The index is rebuilt from a [`ChannelSnapshot`] and swapped atomically; a
//! request only ever reads one immutable index.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rand::Rng;

use onerelay_provider_core::{Channel, RelayError};
use onerelay_storage::ChannelSnapshot;

/// Every candidate contributes `weight + 10`, so zero-weight channels still get traffic.
pub const WEIGHT_FLOOR: i64 = 10;

#[derive(Debug, thiserror::Error)]
#[error("no available channel for model {model} under group {group}")]
pub struct NoEligibleChannel {
    pub group: String,
    pub model: String,
}

impl From<NoEligibleChannel> for RelayError {
    fn from(err: NoEligibleChannel) -> Self {
        RelayError::local(503, "model_not_found", err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    channel_id: i64,
    weight: u32,
}

#[derive(Debug, Clone)]
struct Tier {
    priority: i64,
    /// Ordered by weight, heaviest first.
    candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelIndex {
    channels: HashMap<i64, Arc<Channel>>,
    /// (group, model) → tiers ordered by priority, highest first.
    tiers: HashMap<(String, String), Vec<Tier>>,
}

impl ChannelIndex {
    pub fn build(snapshot: &ChannelSnapshot) -> Self {
        let channels: HashMap<i64, Arc<Channel>> = snapshot
            .channels
            .iter()
            .map(|channel| (channel.id, Arc::new(channel.clone())))
            .collect();

        let mut grouped: HashMap<(String, String), HashMap<i64, Vec<Candidate>>> = HashMap::new();
        for ability in &snapshot.abilities {
            if !ability.enabled || !channels.contains_key(&ability.channel_id) {
                continue;
            }
            grouped
                .entry((ability.group.clone(), ability.model.clone()))
                .or_default()
                .entry(ability.priority)
                .or_default()
                .push(Candidate {
                    channel_id: ability.channel_id,
                    weight: ability.weight,
                });
        }

        let tiers = grouped
            .into_iter()
            .map(|(key, by_priority)| {
                let mut tiers: Vec<Tier> = by_priority
                    .into_iter()
                    .map(|(priority, mut candidates)| {
                        candidates.sort_by(|a, b| {
                            b.weight.cmp(&a.weight).then(a.channel_id.cmp(&b.channel_id))
                        });
                        Tier {
                            priority,
                            candidates,
                        }
                    })
                    .collect();
                tiers.sort_by(|a, b| b.priority.cmp(&a.priority));
                (key, tiers)
            })
            .collect();

        Self { channels, tiers }
    }

    pub fn channel(&self, id: i64) -> Option<Arc<Channel>> {
        self.channels.get(&id).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of distinct priorities serving (group, model).
    pub fn tier_count(&self, group: &str, model: &str) -> usize {
        self.tiers
            .get(&(group.to_string(), model.to_string()))
            .map_or(0, Vec::len)
    }

    /// Picks a channel for the `retry`-th attempt.
    ///
    /// Attempt `k` reads tier `k`; attempts past the last tier keep reading the
    /// lowest one. Inside a tier the pick is weighted random.
    pub fn select_channel<R: Rng + ?Sized>(
        &self,
        group: &str,
        model: &str,
        retry: u32,
        rng: &mut R,
    ) -> Result<Arc<Channel>, NoEligibleChannel> {
        let no_channel = || NoEligibleChannel {
            group: group.to_string(),
            model: model.to_string(),
        };
        let tiers = self
            .tiers
            .get(&(group.to_string(), model.to_string()))
            .filter(|tiers| !tiers.is_empty())
            .ok_or_else(no_channel)?;

        let index = (retry as usize).min(tiers.len() - 1);
        let candidates = &tiers[index].candidates;
        let total: i64 = candidates
            .iter()
            .map(|c| c.weight as i64 + WEIGHT_FLOOR)
            .sum();
        if total <= 0 {
            return Err(no_channel());
        }

        let picked = weighted_pick(candidates, rng.random_range(0..total));
        picked
            .and_then(|c| self.channel(c.channel_id))
            .ok_or_else(no_channel)
    }

    /// Models reachable from `group`, sorted.
    pub fn enabled_models(&self, group: &str) -> Vec<String> {
        self.tiers
            .keys()
            .filter(|(g, _)| g == group)
            .map(|(_, model)| model.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Walks `candidates` subtracting `weight + 10` from `draw` until it reaches zero or below.
fn weighted_pick(candidates: &[Candidate], draw: i64) -> Option<&Candidate> {
    let mut remaining = draw;
    for candidate in candidates {
        remaining -= candidate.weight as i64 + WEIGHT_FLOOR;
        if remaining <= 0 {
            return Some(candidate);
        }
    }
    candidates.last()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use onerelay_provider_core::{ChannelStatus, ChannelType};

    use super::*;

    fn channel(id: i64, priority: i64, weight: u32) -> Channel {
        let mut channel = Channel::new(id, format!("c{id}"), ChannelType::OpenAI);
        channel.models = vec!["gpt-4o".to_string()];
        channel.groups = vec!["default".to_string()];
        channel.priority = priority;
        channel.weight = weight;
        channel
    }

    fn index(channels: Vec<Channel>) -> ChannelIndex {
        let abilities = channels.iter().flat_map(Channel::abilities).collect();
        ChannelIndex::build(&ChannelSnapshot {
            channels,
            abilities,
        })
    }

    #[test]
    fn selection_frequency_follows_weight_plus_floor() {
        let index = index(vec![channel(1, 0, 0), channel(2, 0, 10), channel(3, 0, 30)]);
        let mut rng = StdRng::seed_from_u64(7);
        let draws = 70_000;
        let mut hits: HashMap<i64, u32> = HashMap::new();
        for _ in 0..draws {
            let picked = index.select_channel("default", "gpt-4o", 0, &mut rng).unwrap();
            *hits.entry(picked.id).or_default() += 1;
        }
        for (id, expected) in [(1, 10.0 / 70.0), (2, 20.0 / 70.0), (3, 40.0 / 70.0)] {
            let observed = hits[&id] as f64 / draws as f64;
            assert!(
                (observed - expected).abs() < 0.03,
                "channel {id}: observed {observed}, expected {expected}"
            );
        }
    }

    #[test]
    fn weighted_walk_stops_at_zero() {
        let candidates = [
            Candidate { channel_id: 1, weight: 30 },
            Candidate { channel_id: 2, weight: 10 },
        ];
        let pick = |draw| weighted_pick(&candidates, draw).map(|c| c.channel_id);
        // Draws range over 0..60.
        assert_eq!(pick(0), Some(1));
        assert_eq!(pick(40), Some(1));
        assert_eq!(pick(41), Some(2));
        assert_eq!(pick(59), Some(2));
        assert_eq!(weighted_pick(&[], 0), None);
    }

    #[test]
    fn retries_walk_tiers_and_clamp_to_lowest() {
        let index = index(vec![channel(1, 10, 0), channel(2, 5, 0), channel(3, 0, 0)]);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(index.tier_count("default", "gpt-4o"), 3);
        for (retry, expected) in [(0, 1), (1, 2), (2, 3), (3, 3), (9, 3)] {
            let picked = index
                .select_channel("default", "gpt-4o", retry, &mut rng)
                .unwrap();
            assert_eq!(picked.id, expected, "retry {retry}");
        }
    }

    #[test]
    fn disabled_and_unknown_pairs_have_no_channel() {
        let mut disabled = channel(1, 0, 0);
        disabled.status = ChannelStatus::AutoDisabled;
        let index = index(vec![disabled]);
        let mut rng = StdRng::seed_from_u64(1);
        let err = index
            .select_channel("default", "gpt-4o", 0, &mut rng)
            .unwrap_err();
        assert_eq!(err.model, "gpt-4o");
        assert!(index.select_channel("vip", "gpt-4o", 0, &mut rng).is_err());

        let relay: RelayError = err.into();
        assert_eq!(relay.status, 503);
        assert!(relay.is_local());
    }

    #[test]
    fn enabled_models_are_per_group() {
        let mut vip = channel(2, 0, 0);
        vip.models = vec!["claude-sonnet-4-20250514".to_string(), "gpt-4o".to_string()];
        vip.groups = vec!["vip".to_string()];
        let index = index(vec![channel(1, 0, 0), vip]);
        assert_eq!(index.enabled_models("default"), vec!["gpt-4o"]);
        assert_eq!(
            index.enabled_models("vip"),
            vec!["claude-sonnet-4-20250514", "gpt-4o"]
        );
    }
}
