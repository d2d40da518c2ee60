//! The durable pending queue the drivers hand transactions through.
//!
//! Entries are keyed by zero-padded score then txid, so iteration yields
//! them in `(height, block index)` order. A side marker per txid keeps
//! membership unique across rescheduling, and the subscriber's resume
//! height lives next to the queue.

use bitcoin::Txid;
use kv::Bucket;
use kv::Store;
use opns_common::Score;

use crate::error::NodeError;

pub struct PendingQueue {
    entries: Bucket<'static, String, Vec<u8>>,
    meta: Bucket<'static, String, Vec<u8>>,
}

fn entry_key(score: Score, txid: &Txid) -> String {
    format!("{score:020}:{txid}")
}

fn marker_key(txid: &Txid) -> String {
    format!("queued:{txid}")
}

fn progress_key(subscription: &str) -> String {
    format!("progress:{subscription}")
}

impl PendingQueue {
    pub fn new(store: &Store) -> Result<PendingQueue, NodeError> {
        Ok(PendingQueue {
            entries: store.bucket(Some("pending"))?,
            meta: store.bucket(Some("queue_meta"))?,
        })
    }

    /// Schedules `txid` at `score`. Re-pushing moves it instead of
    /// duplicating it.
    pub fn push(&self, txid: &Txid, score: Score) -> Result<(), NodeError> {
        if let Some(existing) = self.scheduled_score(txid)? {
            if existing == score {
                return Ok(());
            }
            self.entries.remove(&entry_key(existing, txid))?;
        }
        self.entries
            .set(&entry_key(score, txid), &txid.to_string().into_bytes())?;
        self.meta
            .set(&marker_key(txid), &score.to_string().into_bytes())?;
        self.entries.flush()?;
        self.meta.flush()?;
        Ok(())
    }

    pub fn remove(&self, txid: &Txid) -> Result<(), NodeError> {
        if let Some(score) = self.scheduled_score(txid)? {
            self.entries.remove(&entry_key(score, txid))?;
            self.meta.remove(&marker_key(txid))?;
            self.entries.flush()?;
            self.meta.flush()?;
        }
        Ok(())
    }

    pub fn scheduled_score(&self, txid: &Txid) -> Result<Option<Score>, NodeError> {
        let Some(raw) = self.meta.get(&marker_key(txid))? else {
            return Ok(None);
        };
        let digits =
            String::from_utf8(raw).map_err(|e| NodeError::CorruptQueue(e.to_string()))?;
        digits
            .parse()
            .map(Some)
            .map_err(|e| NodeError::CorruptQueue(format!("score {digits}: {e}")))
    }

    /// Everything queued, in score order. A snapshot: the queue may be
    /// pushed to while the caller works through it.
    pub fn drain_ordered(&self) -> Result<Vec<(Score, Txid)>, NodeError> {
        let mut pending = Vec::new();
        for item in self.entries.iter() {
            let item = item?;
            let key = item.key::<String>()?;
            let (score, txid) = key
                .split_once(':')
                .ok_or_else(|| NodeError::CorruptQueue(key.clone()))?;
            let score: Score = score
                .parse()
                .map_err(|e| NodeError::CorruptQueue(format!("{key}: {e}")))?;
            let txid: Txid = txid
                .parse()
                .map_err(|e| NodeError::CorruptQueue(format!("{key}: {e}")))?;
            pending.push((score, txid));
        }
        Ok(pending)
    }

    pub fn len(&self) -> Result<usize, NodeError> {
        Ok(self.entries.iter().count())
    }

    pub fn is_empty(&self) -> Result<bool, NodeError> {
        Ok(self.entries.iter().next().is_none())
    }

    /// Resume height of a feed subscription.
    pub fn progress(&self, subscription: &str) -> Result<Option<u32>, NodeError> {
        let Some(raw) = self.meta.get(&progress_key(subscription))? else {
            return Ok(None);
        };
        let digits =
            String::from_utf8(raw).map_err(|e| NodeError::CorruptQueue(e.to_string()))?;
        digits
            .parse()
            .map(Some)
            .map_err(|e| NodeError::CorruptQueue(format!("progress {digits}: {e}")))
    }

    pub fn set_progress(&self, subscription: &str, height: u32) -> Result<(), NodeError> {
        self.meta
            .set(&progress_key(subscription), &height.to_string().into_bytes())?;
        self.meta.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use kv::Config;
    use opns_common::block_score;

    use super::*;

    fn get_test_queue() -> PendingQueue {
        let test_id = rand::random::<u32>();
        let store = Store::new(Config::new(format!("./tmp-db/{test_id}.queue/"))).unwrap();
        PendingQueue::new(&store).unwrap()
    }

    fn txid(tag: u8) -> Txid {
        Txid::from_byte_array([tag; 32])
    }

    #[test]
    fn test_queue_orders_by_score() {
        let queue = get_test_queue();
        queue.push(&txid(1), block_score(30, 0)).unwrap();
        queue.push(&txid(2), block_score(10, 5)).unwrap();
        queue.push(&txid(3), block_score(10, 2)).unwrap();

        let pending = queue.drain_ordered().unwrap();
        let order: Vec<Txid> = pending.iter().map(|(_, txid)| *txid).collect();
        assert_eq!(order, vec![txid(3), txid(2), txid(1)]);
    }

    #[test]
    fn test_push_is_idempotent_and_moves() {
        let queue = get_test_queue();
        queue.push(&txid(4), 100).unwrap();
        queue.push(&txid(4), 100).unwrap();
        assert_eq!(queue.len().unwrap(), 1);

        queue.push(&txid(4), 50).unwrap();
        let pending = queue.drain_ordered().unwrap();
        assert_eq!(pending, vec![(50, txid(4))]);
    }

    #[test]
    fn test_remove() {
        let queue = get_test_queue();
        queue.push(&txid(5), 10).unwrap();
        queue.remove(&txid(5)).unwrap();
        assert!(queue.is_empty().unwrap());
        // Removing an unknown txid is a no-op.
        queue.remove(&txid(6)).unwrap();
    }

    #[test]
    fn test_progress_round_trip() {
        let queue = get_test_queue();
        assert_eq!(queue.progress("sub").unwrap(), None);
        queue.set_progress("sub", 800_000).unwrap();
        assert_eq!(queue.progress("sub").unwrap(), Some(800_000));
    }
}
