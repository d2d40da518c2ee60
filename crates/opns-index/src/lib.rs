// SPDX-License-Identifier: MIT

//! The event-indexed lookup side of the overlay.
//!
//! For every admitted output the index derives a set of event keys from its
//! script (`mine:<domain>`, `opns:<domain>`, `p2pkh:<address>`,
//! `list:<domain>`, `spent`), maintains score-ordered sets from those keys
//! to outpoints, answers range and join queries over them, and publishes a
//! live stream of every indexed event.

pub mod sorted_set;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::Script;
use kv::Store;
use log::trace;
use opns_common::block_score;
use opns_common::impl_error_from;
use opns_common::unconfirmed_score;
use opns_common::Outpoint;
use opns_common::Score;
use opns_overlay::EngineError;
use opns_overlay::LookupAnswer;
use opns_overlay::LookupQuestion;
use opns_overlay::LookupService;
use opns_overlay::OutputListItem;
use opns_protocol::beef::parse_beef;
use opns_protocol::script::decode_inscription;
use opns_protocol::script::decode_p2pkh;
use opns_protocol::script::is_ord_lock;
use opns_protocol::script::Opns;
use opns_protocol::script::OPNS_CONTENT_TYPE;
use opns_storage::OverlayStore;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::sorted_set::EventSets;

/// The event key recording spends.
pub const SPENT_EVENT: &str = "spent";

#[derive(Debug)]
pub enum EventIndexError {
    Kv(kv::Error),
    Serde(serde_json::Error),
    Corrupt(String),
}

impl core::fmt::Display for EventIndexError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EventIndexError::Kv(e) => write!(f, "kv: {e}"),
            EventIndexError::Serde(e) => write!(f, "encoding: {e}"),
            EventIndexError::Corrupt(detail) => write!(f, "corrupt index entry: {detail}"),
        }
    }
}

impl std::error::Error for EventIndexError {}

impl_error_from!(EventIndexError, kv::Error, Kv);
impl_error_from!(EventIndexError, serde_json::Error, Serde);

impl From<EventIndexError> for EngineError {
    fn from(e: EventIndexError) -> Self {
        EngineError::Index(e.to_string())
    }
}

/// How multiple event sets combine in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Intersect,
    Union,
    Difference,
}

impl Serialize for JoinType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            JoinType::Intersect => 0,
            JoinType::Union => 1,
            JoinType::Difference => 2,
        })
    }
}

impl<'de> Deserialize<'de> for JoinType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(JoinType::Intersect),
            1 => Ok(JoinType::Union),
            2 => Ok(JoinType::Difference),
            other => Err(serde::de::Error::custom(format!(
                "invalid join type {other}"
            ))),
        }
    }
}

/// Exclusive starting position of a range query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPos {
    pub height: u32,
    pub idx: u64,
}

impl BlockPos {
    pub fn score(&self) -> Score {
        block_score(self.height, self.idx)
    }
}

/// The `ls_OpNS` query format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Question {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
    #[serde(default, rename = "join", skip_serializing_if = "Option::is_none")]
    pub join_type: Option<JoinType>,
    #[serde(default)]
    pub from: BlockPos,
    /// Zero means unbounded.
    #[serde(default)]
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spent: Option<bool>,
    #[serde(default, rename = "rev")]
    pub reverse: bool,
}

/// One indexed event, as published on the live bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub event: String,
    pub outpoint: String,
    pub score: Score,
}

/// Fan-out channel for live event notifications. Subscribers filter by
/// event key; slow subscribers lose old messages rather than block the
/// indexer.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventMessage>,
}

impl EventBus {
    pub fn new(capacity: usize) -> EventBus {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventMessage> {
        self.sender.subscribe()
    }

    pub fn publish(&self, message: EventMessage) {
        // No receivers is fine; the stream is best-effort.
        let _ = self.sender.send(message);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(1024)
    }
}

/// The `ls_OpNS` lookup service: event derivation, sorted-set maintenance,
/// joins and answer assembly.
pub struct EventLookup<S: OverlayStore> {
    sets: EventSets,
    storage: Arc<S>,
    topic: String,
    bus: EventBus,
}

impl<S: OverlayStore> EventLookup<S> {
    pub fn new(store: &Store, storage: Arc<S>, topic: &str) -> Result<Self, EventIndexError> {
        Ok(EventLookup {
            sets: EventSets::new(store)?,
            storage,
            topic: topic.to_string(),
            bus: EventBus::default(),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Members of one event set, ascending by score.
    pub fn members(&self, event: &str) -> Result<Vec<(String, Score)>, EventIndexError> {
        self.sets.members(event)
    }

    /// Distinct populated event keys under a prefix, e.g. `opns:`.
    pub fn events_with_prefix(&self, prefix: &str) -> Result<Vec<String>, EventIndexError> {
        self.sets.events_with_prefix(prefix)
    }

    /// Event keys currently containing `outpoint`.
    pub fn outpoint_events(&self, outpoint: &Outpoint) -> Result<Vec<String>, EventIndexError> {
        self.sets.outpoint_events(&outpoint.to_string())
    }

    /// Indexes `outpoint` under each event key and publishes the change.
    pub fn save_events(
        &self,
        outpoint: &Outpoint,
        events: &[String],
        block_height: u32,
        block_idx: u64,
    ) -> Result<(), EventIndexError> {
        let score = if block_height > 0 {
            block_score(block_height, block_idx)
        } else {
            unconfirmed_score()
        };
        let member = outpoint.to_string();
        for event in events {
            self.sets.add(event, &member, score)?;
            self.sets.add_outpoint_event(&member, event)?;
            self.bus.publish(EventMessage {
                event: event.clone(),
                outpoint: member.clone(),
                score,
            });
        }
        Ok(())
    }

    /// Derives the event keys of a freshly admitted output.
    ///
    /// The domain tag of non-frontier outputs is inherited through the
    /// ordinal-carry rule: the input at the output's cumulative-satoshi
    /// position donates its first `opns:*` event.
    fn derive_events(
        &self,
        outpoint: &Outpoint,
        script: &Script,
    ) -> Result<Vec<String>, EngineError> {
        let mut events = Vec::new();
        let mut domain = String::new();

        let output = self
            .storage
            .find_output(outpoint, Some(&self.topic), None, true)
            .map_err(EngineError::storage)?
            .ok_or(EngineError::OutputNotFound(*outpoint))?;
        let (beef, _) = parse_beef(&output.beef)?;
        if let Some(tx) = beef.find_transaction(&outpoint.txid) {
            let sats_out: u64 = tx
                .output
                .iter()
                .take(outpoint.vout as usize)
                .map(|o| o.value.to_sat())
                .sum();
            let mut sats_in = 0u64;
            for (vin, input) in tx.input.iter().enumerate() {
                let Some(source) = beef.source_output(tx, vin) else {
                    break;
                };
                if sats_in < sats_out {
                    sats_in += source.value.to_sat();
                    continue;
                }
                if sats_in == sats_out {
                    let source_outpoint = Outpoint::from(input.previous_output);
                    for event in self.sets.outpoint_events(&source_outpoint.to_string())? {
                        if let Some(inherited) = event.strip_prefix("opns:") {
                            domain = inherited.to_string();
                            events.push(event);
                            break;
                        }
                    }
                }
                break;
            }
        }

        if let Some(opns) = Opns::decode(script) {
            events.push(format!("mine:{}", opns.domain));
        } else if let Some(inscription) = decode_inscription(script) {
            if inscription.content_type == OPNS_CONTENT_TYPE {
                domain = String::from_utf8_lossy(&inscription.content).into_owned();
                events.push(format!("opns:{domain}"));
                let prefix = Script::from_bytes(&inscription.script_prefix);
                let suffix = Script::from_bytes(&inscription.script_suffix);
                if let Some(address) = decode_p2pkh(prefix) {
                    events.push(format!("p2pkh:{address}"));
                } else if let Some(address) = decode_p2pkh(suffix) {
                    events.push(format!("p2pkh:{address}"));
                }
            }
        }
        if let Some(address) = decode_p2pkh(script) {
            events.push(format!("p2pkh:{address}"));
        } else if is_ord_lock(script) && !domain.is_empty() {
            events.push(format!("list:{domain}"));
        }

        Ok(events)
    }

    /// Resolves a parsed question to an ordered, filtered, truncated list
    /// of members.
    fn select_members(&self, question: &Question) -> Result<Vec<String>, EngineError> {
        let start_score = question.from.score();

        let mut selected: Vec<(String, Score)> = match &question.events {
            Some(events) if !events.is_empty() => {
                let mut sets = Vec::with_capacity(events.len());
                for event in events {
                    let members: HashMap<String, Score> =
                        self.sets.members(event)?.into_iter().collect();
                    sets.push(members);
                }

                let join = question.join_type.unwrap_or(JoinType::Intersect);
                let mut combined: HashMap<String, Score> = HashMap::new();
                match join {
                    JoinType::Intersect => {
                        for (member, score) in &sets[0] {
                            let mut min = *score;
                            let everywhere = sets[1..].iter().all(|other| {
                                if let Some(other_score) = other.get(member) {
                                    min = min.min(*other_score);
                                    true
                                } else {
                                    false
                                }
                            });
                            if everywhere {
                                combined.insert(member.clone(), min);
                            }
                        }
                    }
                    JoinType::Union => {
                        for set in &sets {
                            for (member, score) in set {
                                combined
                                    .entry(member.clone())
                                    .and_modify(|existing| *existing = (*existing).min(*score))
                                    .or_insert(*score);
                            }
                        }
                    }
                    JoinType::Difference => {
                        let others: HashSet<&String> =
                            sets[1..].iter().flat_map(|set| set.keys()).collect();
                        for (member, score) in &sets[0] {
                            if !others.contains(member) {
                                combined.insert(member.clone(), *score);
                            }
                        }
                    }
                }
                combined.into_iter().collect()
            }
            _ => match &question.event {
                Some(event) => self.sets.members(event)?,
                None => Vec::new(),
            },
        };

        selected.sort_by(|a, b| {
            if question.reverse {
                b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0))
            } else {
                a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))
            }
        });

        let mut members = Vec::new();
        for (member, score) in selected {
            let in_range = if question.reverse {
                score < start_score
            } else {
                score > start_score
            };
            if !in_range {
                continue;
            }
            members.push(member);
            if question.limit > 0 && members.len() >= question.limit {
                break;
            }
        }
        Ok(members)
    }
}

impl<S: OverlayStore> LookupService for EventLookup<S> {
    fn output_added(
        &self,
        outpoint: &Outpoint,
        script: &Script,
        _topic: &str,
        block_height: u32,
        block_idx: u64,
    ) -> Result<(), EngineError> {
        let events = self.derive_events(outpoint, script)?;
        trace!("indexing {outpoint} under {events:?}");
        self.save_events(outpoint, &events, block_height, block_idx)?;
        Ok(())
    }

    fn output_spent(&self, outpoint: &Outpoint, _topic: &str) -> Result<(), EngineError> {
        self.save_events(outpoint, &[SPENT_EVENT.to_string()], 0, 0)?;
        Ok(())
    }

    fn output_deleted(&self, outpoint: &Outpoint, _topic: &str) -> Result<(), EngineError> {
        let member = outpoint.to_string();
        for event in self.sets.outpoint_events(&member)? {
            self.sets.remove(&event, &member)?;
        }
        self.sets.clear_outpoint_events(&member)?;
        Ok(())
    }

    fn output_block_height_updated(
        &self,
        outpoint: &Outpoint,
        block_height: u32,
        block_idx: u64,
    ) -> Result<(), EngineError> {
        let score = if block_height > 0 {
            block_score(block_height, block_idx)
        } else {
            unconfirmed_score()
        };
        let member = outpoint.to_string();
        for event in self.sets.outpoint_events(&member)? {
            self.sets.add(&event, &member, score)?;
        }
        Ok(())
    }

    fn lookup(&self, question: &LookupQuestion) -> Result<LookupAnswer, EngineError> {
        let question: Question =
            serde_json::from_slice(&question.query).map_err(EngineError::InvalidQuery)?;
        let members = self.select_members(&question)?;

        let mut items = Vec::with_capacity(members.len());
        for member in members {
            let outpoint: Outpoint = member
                .parse()
                .map_err(|e| EngineError::Index(format!("bad member {member}: {e}")))?;
            let output = match self
                .storage
                .find_output(&outpoint, Some(&self.topic), question.spent, true)
                .map_err(EngineError::storage)?
            {
                Some(output) => output,
                // With a spent filter, absence is filtering. Without one,
                // the index references something storage lost.
                None if question.spent.is_some() => continue,
                None => return Err(EngineError::OutputNotFound(outpoint)),
            };

            let (mut beef, _) = parse_beef(&output.beef)?;
            if !output.ancillary_beef.is_empty() {
                beef.merge_beef_bytes(&output.ancillary_beef)?;
            }
            items.push(OutputListItem {
                output_index: outpoint.vout,
                beef: beef.to_atomic_bytes(&outpoint.txid)?,
            });
        }
        Ok(LookupAnswer::output_list(items))
    }
}

#[cfg(test)]
mod tests {
    use kv::Config;
    use opns_storage::memory_store::MemoryOverlayStore;

    use super::*;

    fn get_test_lookup() -> EventLookup<MemoryOverlayStore> {
        let test_id = rand::random::<u32>();
        let store = Store::new(Config::new(format!("./tmp-db/{test_id}.index/"))).unwrap();
        EventLookup::new(&store, Arc::new(MemoryOverlayStore::new()), "tm_OpNS").unwrap()
    }

    fn outpoint(tag: u8, vout: u32) -> Outpoint {
        use bitcoin::hashes::Hash;
        Outpoint::new(bitcoin::Txid::from_byte_array([tag; 32]), vout)
    }

    fn question_bytes(question: &Question) -> Vec<u8> {
        serde_json::to_vec(question).unwrap()
    }

    #[test]
    fn test_event_index_invariant() {
        let lookup = get_test_lookup();
        let op = outpoint(1, 0);
        lookup
            .save_events(
                &op,
                &["mine:a".to_string(), "opns:a".to_string()],
                10,
                1,
            )
            .unwrap();

        // Forward and reverse indexes agree.
        let events = lookup.outpoint_events(&op).unwrap();
        assert_eq!(events, vec!["mine:a".to_string(), "opns:a".to_string()]);
        for event in &events {
            let members = lookup.members(event).unwrap();
            assert!(members.iter().any(|(member, _)| member == &op.to_string()));
        }
    }

    #[test]
    fn test_delete_is_idempotent() {
        let lookup = get_test_lookup();
        let op = outpoint(2, 0);
        lookup
            .save_events(&op, &["mine:b".to_string()], 10, 1)
            .unwrap();

        lookup.output_deleted(&op, "tm_OpNS").unwrap();
        assert!(lookup.outpoint_events(&op).unwrap().is_empty());
        assert!(lookup.members("mine:b").unwrap().is_empty());

        // Second delete leaves the same state.
        lookup.output_deleted(&op, "tm_OpNS").unwrap();
        assert!(lookup.outpoint_events(&op).unwrap().is_empty());
    }

    #[test]
    fn test_rescore_updates_every_set() {
        let lookup = get_test_lookup();
        let op = outpoint(3, 0);
        lookup
            .save_events(&op, &["mine:c".to_string(), "opns:c".to_string()], 0, 0)
            .unwrap();

        lookup.output_block_height_updated(&op, 42, 7).unwrap();
        let expected = block_score(42, 7);
        for event in ["mine:c", "opns:c"] {
            let members = lookup.members(event).unwrap();
            assert_eq!(members, vec![(op.to_string(), expected)]);
        }
    }

    #[test]
    fn test_spent_event() {
        let lookup = get_test_lookup();
        let op = outpoint(4, 0);
        lookup.output_spent(&op, "tm_OpNS").unwrap();
        let members = lookup.members(SPENT_EVENT).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].0, op.to_string());
        // Spends are wall-clock scored.
        assert!(members[0].1 > block_score(1_000_000, 0));
        assert_eq!(
            lookup.outpoint_events(&op).unwrap(),
            vec![SPENT_EVENT.to_string()]
        );
    }

    #[test]
    fn test_join_semantics() {
        let lookup = get_test_lookup();
        let a = outpoint(5, 0);
        let b = outpoint(6, 0);
        let c = outpoint(7, 0);
        lookup.save_events(&a, &["ev:x".to_string()], 1, 0).unwrap();
        lookup
            .save_events(&b, &["ev:x".to_string(), "ev:y".to_string()], 2, 0)
            .unwrap();
        lookup.save_events(&c, &["ev:y".to_string()], 3, 0).unwrap();

        let select = |join, events: &[&str]| {
            lookup
                .select_members(&Question {
                    events: Some(events.iter().map(|s| s.to_string()).collect()),
                    join_type: Some(join),
                    ..Default::default()
                })
                .unwrap()
        };

        let intersect = select(JoinType::Intersect, &["ev:x", "ev:y"]);
        assert_eq!(intersect, vec![b.to_string()]);

        let union = select(JoinType::Union, &["ev:x", "ev:y"]);
        assert_eq!(
            union,
            vec![a.to_string(), b.to_string(), c.to_string()]
        );
        // Intersect is always a subset of union.
        assert!(intersect.iter().all(|member| union.contains(member)));

        let difference = select(JoinType::Difference, &["ev:x", "ev:y"]);
        assert_eq!(difference, vec![a.to_string()]);
    }

    #[test]
    fn test_range_filter_and_limit() {
        let lookup = get_test_lookup();
        for (tag, height) in [(8u8, 10u32), (9, 20), (10, 30), (11, 40)] {
            lookup
                .save_events(&outpoint(tag, 0), &["ev:r".to_string()], height, 0)
                .unwrap();
        }

        // Forward: strictly greater than the bound.
        let forward = lookup
            .select_members(&Question {
                event: Some("ev:r".to_string()),
                from: BlockPos { height: 20, idx: 0 },
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            forward,
            vec![outpoint(10, 0).to_string(), outpoint(11, 0).to_string()]
        );

        // Reverse: strictly less, descending.
        let reverse = lookup
            .select_members(&Question {
                event: Some("ev:r".to_string()),
                from: BlockPos { height: 30, idx: 0 },
                reverse: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            reverse,
            vec![outpoint(9, 0).to_string(), outpoint(8, 0).to_string()]
        );

        // Limit truncates after ordering.
        let limited = lookup
            .select_members(&Question {
                event: Some("ev:r".to_string()),
                limit: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited, vec![outpoint(8, 0).to_string()]);
    }

    #[test]
    fn test_intersect_aggregates_min_score() {
        let lookup = get_test_lookup();
        let op = outpoint(12, 0);
        lookup.save_events(&op, &["ev:m".to_string()], 5, 0).unwrap();
        lookup.save_events(&op, &["ev:n".to_string()], 9, 0).unwrap();

        // With MIN aggregation the member sits below a bound of (7, 0).
        let members = lookup
            .select_members(&Question {
                events: Some(vec!["ev:m".to_string(), "ev:n".to_string()]),
                join_type: Some(JoinType::Intersect),
                from: BlockPos { height: 7, idx: 0 },
                reverse: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(members, vec![op.to_string()]);
    }

    #[test]
    fn test_bus_publishes_saved_events() {
        let lookup = get_test_lookup();
        let mut receiver = lookup.bus().subscribe();
        let op = outpoint(13, 0);
        lookup
            .save_events(&op, &["mine:z".to_string()], 50, 2)
            .unwrap();

        let message = receiver.try_recv().unwrap();
        assert_eq!(message.event, "mine:z");
        assert_eq!(message.outpoint, op.to_string());
        assert_eq!(message.score, block_score(50, 2));
    }

    #[test]
    fn test_lookup_rejects_bad_query() {
        let lookup = get_test_lookup();
        let result = lookup.lookup(&LookupQuestion {
            service: "ls_OpNS".to_string(),
            query: b"not json".to_vec(),
        });
        assert!(matches!(result, Err(EngineError::InvalidQuery(_))));
        // An empty question yields an empty answer.
        let answer = lookup
            .lookup(&LookupQuestion {
                service: "ls_OpNS".to_string(),
                query: question_bytes(&Question::default()),
            })
            .unwrap();
        assert!(answer.outputs.is_empty());
    }
}
