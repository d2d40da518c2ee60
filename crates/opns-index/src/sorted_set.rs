//! Score-ordered event sets over a key-value store.
//!
//! Bucket layout:
//!
//! - `event_sets`: `<event> 0x00 <score:020> <member>` → member; the
//!   zero-padded decimal score makes a prefix scan yield members in score
//!   order
//! - `event_scores`: `<event> 0x00 <member>` → current score, so a member
//!   can be moved or removed without knowing its score
//! - `outpoint_events`: `<member>` → JSON list of event keys containing the
//!   member (the reverse index)

use kv::Bucket;
use kv::Store;
use opns_common::Score;

use crate::EventIndexError;

pub struct EventSets {
    sets: Bucket<'static, String, Vec<u8>>,
    scores: Bucket<'static, String, Vec<u8>>,
    reverse: Bucket<'static, String, Vec<u8>>,
}

fn set_key(event: &str, score: Score, member: &str) -> String {
    format!("{event}\x00{score:020}{member}")
}

fn score_key(event: &str, member: &str) -> String {
    format!("{event}\x00{member}")
}

impl EventSets {
    pub fn new(store: &Store) -> Result<EventSets, EventIndexError> {
        Ok(EventSets {
            sets: store.bucket(Some("event_sets"))?,
            scores: store.bucket(Some("event_scores"))?,
            reverse: store.bucket(Some("outpoint_events"))?,
        })
    }

    /// Inserts or re-scores `member` within `event`.
    pub fn add(&self, event: &str, member: &str, score: Score) -> Result<(), EventIndexError> {
        if let Some(old) = self.score(event, member)? {
            if old == score {
                return Ok(());
            }
            self.sets.remove(&set_key(event, old, member))?;
        }
        self.sets
            .set(&set_key(event, score, member), &member.as_bytes().to_vec())?;
        self.scores
            .set(&score_key(event, member), &score.to_string().into_bytes())?;
        self.sets.flush()?;
        self.scores.flush()?;
        Ok(())
    }

    pub fn remove(&self, event: &str, member: &str) -> Result<(), EventIndexError> {
        if let Some(score) = self.score(event, member)? {
            self.sets.remove(&set_key(event, score, member))?;
            self.scores.remove(&score_key(event, member))?;
            self.sets.flush()?;
            self.scores.flush()?;
        }
        Ok(())
    }

    pub fn score(&self, event: &str, member: &str) -> Result<Option<Score>, EventIndexError> {
        let Some(raw) = self.scores.get(&score_key(event, member))? else {
            return Ok(None);
        };
        let digits = String::from_utf8(raw)
            .map_err(|e| EventIndexError::Corrupt(e.to_string()))?;
        digits
            .parse()
            .map(Some)
            .map_err(|e| EventIndexError::Corrupt(format!("score {digits}: {e}")))
    }

    /// All members of `event` with their scores, ascending by score.
    pub fn members(&self, event: &str) -> Result<Vec<(String, Score)>, EventIndexError> {
        let prefix = format!("{event}\x00");
        let mut members = Vec::new();
        for item in self.sets.iter_prefix(&prefix)? {
            let item = item?;
            let key = item.key::<String>()?;
            let score: Score = key
                .get(prefix.len()..prefix.len() + 20)
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(|| EventIndexError::Corrupt(key.clone()))?;
            let member = String::from_utf8(item.value::<Vec<u8>>()?)
                .map_err(|e| EventIndexError::Corrupt(e.to_string()))?;
            members.push((member, score));
        }
        Ok(members)
    }

    /// Event keys whose sorted set currently contains `member`.
    pub fn outpoint_events(&self, member: &str) -> Result<Vec<String>, EventIndexError> {
        let Some(raw) = self.reverse.get(&member.to_string())? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn add_outpoint_event(&self, member: &str, event: &str) -> Result<(), EventIndexError> {
        let mut events = self.outpoint_events(member)?;
        if !events.iter().any(|existing| existing == event) {
            events.push(event.to_string());
            self.reverse
                .set(&member.to_string(), &serde_json::to_vec(&events)?)?;
            self.reverse.flush()?;
        }
        Ok(())
    }

    pub fn clear_outpoint_events(&self, member: &str) -> Result<(), EventIndexError> {
        self.reverse.remove(&member.to_string())?;
        self.reverse.flush()?;
        Ok(())
    }

    /// Distinct event keys starting with `prefix` that have at least one
    /// member.
    pub fn events_with_prefix(&self, prefix: &str) -> Result<Vec<String>, EventIndexError> {
        let mut events = Vec::new();
        for item in self.scores.iter_prefix(&prefix.to_string())? {
            let item = item?;
            let key = item.key::<String>()?;
            let event = key
                .split('\x00')
                .next()
                .ok_or_else(|| EventIndexError::Corrupt(key.clone()))?
                .to_string();
            if events.last() != Some(&event) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use kv::Config;

    use super::*;

    fn get_test_sets() -> EventSets {
        let test_id = rand::random::<u32>();
        let store = Store::new(Config::new(format!("./tmp-db/{test_id}.sets/"))).unwrap();
        EventSets::new(&store).unwrap()
    }

    #[test]
    fn test_add_and_members_ordering() {
        let sets = get_test_sets();
        sets.add("mine:a", "op1", 30).unwrap();
        sets.add("mine:a", "op2", 10).unwrap();
        sets.add("mine:a", "op3", 20).unwrap();

        let members = sets.members("mine:a").unwrap();
        assert_eq!(
            members,
            vec![
                ("op2".to_string(), 10),
                ("op3".to_string(), 20),
                ("op1".to_string(), 30)
            ]
        );
    }

    #[test]
    fn test_add_rescores_in_place() {
        let sets = get_test_sets();
        sets.add("ev", "op", 5).unwrap();
        sets.add("ev", "op", 50).unwrap();

        assert_eq!(sets.score("ev", "op").unwrap(), Some(50));
        // The old entry is gone, not shadowed.
        assert_eq!(sets.members("ev").unwrap().len(), 1);
    }

    #[test]
    fn test_remove() {
        let sets = get_test_sets();
        sets.add("ev", "op", 5).unwrap();
        sets.remove("ev", "op").unwrap();
        assert_eq!(sets.score("ev", "op").unwrap(), None);
        assert!(sets.members("ev").unwrap().is_empty());
        // Removing twice is a no-op.
        sets.remove("ev", "op").unwrap();
    }

    #[test]
    fn test_reverse_index() {
        let sets = get_test_sets();
        sets.add_outpoint_event("op", "mine:a").unwrap();
        sets.add_outpoint_event("op", "opns:a").unwrap();
        sets.add_outpoint_event("op", "mine:a").unwrap();

        assert_eq!(
            sets.outpoint_events("op").unwrap(),
            vec!["mine:a".to_string(), "opns:a".to_string()]
        );

        sets.clear_outpoint_events("op").unwrap();
        assert!(sets.outpoint_events("op").unwrap().is_empty());
    }

    #[test]
    fn test_events_with_prefix() {
        let sets = get_test_sets();
        sets.add("opns:a", "op1", 1).unwrap();
        sets.add("opns:b", "op2", 1).unwrap();
        sets.add("opns:b", "op3", 2).unwrap();
        sets.add("mine:a", "op4", 1).unwrap();

        let events = sets.events_with_prefix("opns:").unwrap();
        assert_eq!(events, vec!["opns:a".to_string(), "opns:b".to_string()]);
    }
}
