//! BEEF transaction envelopes.
//!
//! A BEEF blob carries a subject transaction together with every ancestor
//! needed to validate it against block headers: raw transactions plus BUMP
//! merkle paths for the mined ones. The overlay stores one envelope per
//! transaction and exchanges them on submission, lookup and sync.
//!
//! Two framings exist: the plain envelope (versions [`BEEF_V1`] and
//! [`BEEF_V2`]) and the atomic form, which prefixes the envelope with a
//! marker and the txid the blob commits to.

use std::collections::HashMap;
use std::collections::HashSet;

use bitcoin::consensus::deserialize_partial;
use bitcoin::consensus::encode;
use bitcoin::consensus::serialize;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::Transaction;
use bitcoin::TxOut;
use bitcoin::Txid;
use opns_common::impl_error_from;

pub const BEEF_V1: u32 = 0xEFBE_0001;
pub const BEEF_V2: u32 = 0xEFBE_0002;
/// Marker prefix of the atomic framing: four `0x01` bytes then the subject
/// txid.
pub const ATOMIC_BEEF: u32 = 0x0101_0101;

#[derive(Debug)]
pub enum BeefError {
    UnsupportedVersion(u32),
    /// Input ended in the middle of a field.
    UnexpectedEof,
    Consensus(encode::Error),
    /// A transaction entry referenced a BUMP index the envelope doesn't
    /// have.
    UnknownBumpIndex(u64),
    /// The requested txid is not a leaf of the path.
    TxidNotInPath(Txid),
    /// A merkle level is missing the sibling needed to fold upwards.
    MissingSibling(u64),
    /// The subject of an atomic envelope is not among its transactions.
    UnknownSubject(Txid),
}

impl core::fmt::Display for BeefError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BeefError::UnsupportedVersion(version) => {
                write!(f, "unsupported BEEF version {version:#010x}")
            }
            BeefError::UnexpectedEof => write!(f, "unexpected end of envelope"),
            BeefError::Consensus(e) => write!(f, "transaction decode: {e}"),
            BeefError::UnknownBumpIndex(index) => write!(f, "unknown BUMP index {index}"),
            BeefError::TxidNotInPath(txid) => write!(f, "txid {txid} not in merkle path"),
            BeefError::MissingSibling(offset) => {
                write!(f, "merkle path misses sibling at offset {offset}")
            }
            BeefError::UnknownSubject(txid) => {
                write!(f, "subject {txid} not present in envelope")
            }
        }
    }
}

impl std::error::Error for BeefError {}

impl_error_from!(BeefError, encode::Error, Consensus);

/// One node of a BUMP level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLeaf {
    pub offset: u64,
    /// Absent only for duplicate markers.
    pub hash: Option<[u8; 32]>,
    /// Marks a level-zero leaf as a txid of interest.
    pub txid: bool,
    /// The right sibling of an odd row end duplicates its left neighbour.
    pub duplicate: bool,
}

/// A BUMP merkle path: for each tree level, the set of hashes a verifier
/// needs to fold the committed txids up to the block's merkle root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerklePath {
    pub block_height: u32,
    pub path: Vec<Vec<PathLeaf>>,
}

impl MerklePath {
    /// The in-block index of `txid`, when it is a leaf of this path.
    pub fn block_index_of(&self, txid: &Txid) -> Option<u64> {
        self.path
            .first()?
            .iter()
            .find(|leaf| leaf.hash == Some(txid.to_byte_array()))
            .map(|leaf| leaf.offset)
    }

    /// Folds `txid` up to the merkle root this path commits to.
    pub fn compute_root(&self, txid: &Txid) -> Result<[u8; 32], BeefError> {
        let mut offset = self
            .block_index_of(txid)
            .ok_or(BeefError::TxidNotInPath(*txid))?;
        let mut working = txid.to_byte_array();

        for level in &self.path {
            let sibling_offset = offset ^ 1;
            let sibling = level
                .iter()
                .find(|leaf| leaf.offset == sibling_offset)
                .ok_or(BeefError::MissingSibling(sibling_offset))?;
            let sibling_hash = if sibling.duplicate {
                working
            } else {
                sibling.hash.ok_or(BeefError::MissingSibling(sibling_offset))?
            };

            let mut concat = [0u8; 64];
            if offset & 1 == 1 {
                concat[..32].copy_from_slice(&sibling_hash);
                concat[32..].copy_from_slice(&working);
            } else {
                concat[..32].copy_from_slice(&working);
                concat[32..].copy_from_slice(&sibling_hash);
            }
            working = sha256d::Hash::hash(&concat).to_byte_array();
            offset >>= 1;
        }
        Ok(working)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, self.block_height as u64);
        buf.push(self.path.len() as u8);
        for level in &self.path {
            write_varint(&mut buf, level.len() as u64);
            for leaf in level {
                write_varint(&mut buf, leaf.offset);
                if leaf.duplicate {
                    buf.push(0x01);
                    continue;
                }
                buf.push(if leaf.txid { 0x02 } else { 0x00 });
                if let Some(hash) = leaf.hash {
                    buf.extend_from_slice(&hash);
                }
            }
        }
        buf
    }

    pub fn read(bytes: &[u8], pos: &mut usize) -> Result<MerklePath, BeefError> {
        let block_height = read_varint(bytes, pos)? as u32;
        let tree_height = read_u8(bytes, pos)? as usize;
        let mut path = Vec::with_capacity(tree_height);
        for _ in 0..tree_height {
            let leaves = read_varint(bytes, pos)? as usize;
            let mut level = Vec::with_capacity(leaves);
            for _ in 0..leaves {
                let offset = read_varint(bytes, pos)?;
                let flags = read_u8(bytes, pos)?;
                let duplicate = flags & 0x01 != 0;
                let hash = if duplicate {
                    None
                } else {
                    let raw = read_bytes(bytes, pos, 32)?;
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(raw);
                    Some(hash)
                };
                level.push(PathLeaf {
                    offset,
                    hash,
                    txid: flags & 0x02 != 0,
                    duplicate,
                });
            }
            path.push(level);
        }
        Ok(MerklePath { block_height, path })
    }
}

/// A transaction entry of an envelope, optionally tied to one of the
/// envelope's BUMPs.
#[derive(Debug, Clone)]
pub struct BeefTx {
    pub tx: Transaction,
    pub bump_index: Option<usize>,
}

/// A parsed envelope. Transactions keep their wire order, ancestors first.
#[derive(Debug, Clone, Default)]
pub struct Beef {
    pub version: u32,
    pub bumps: Vec<MerklePath>,
    txs: Vec<BeefTx>,
    by_txid: HashMap<Txid, usize>,
    /// Txid-only entries (version 2): inputs whose existence a BUMP already
    /// proves, carried without their raw bytes.
    known_txids: Vec<Txid>,
}

impl Beef {
    pub fn new(version: u32) -> Beef {
        Beef {
            version,
            ..Default::default()
        }
    }

    /// Adds a transaction if it is not already present. Returns its txid.
    pub fn merge_transaction(&mut self, tx: &Transaction) -> Txid {
        let txid = tx.compute_txid();
        if !self.by_txid.contains_key(&txid) {
            self.by_txid.insert(txid, self.txs.len());
            self.txs.push(BeefTx {
                tx: tx.clone(),
                bump_index: None,
            });
        }
        txid
    }

    /// Adds a BUMP, deduplicating exact copies. Returns its index.
    pub fn merge_bump(&mut self, bump: MerklePath) -> usize {
        if let Some(index) = self.bumps.iter().position(|existing| *existing == bump) {
            return index;
        }
        self.bumps.push(bump);
        self.bumps.len() - 1
    }

    /// Ties `txid` to a merkle proof, merging the proof into the envelope.
    pub fn attach_proof(&mut self, txid: &Txid, bump: MerklePath) -> Result<(), BeefError> {
        let bump_index = self.merge_bump(bump);
        let index = *self
            .by_txid
            .get(txid)
            .ok_or(BeefError::UnknownSubject(*txid))?;
        self.txs[index].bump_index = Some(bump_index);
        Ok(())
    }

    /// Folds another envelope into this one. Used to extend a stored
    /// envelope with ancillary bytes before answering a lookup.
    pub fn merge_beef(&mut self, other: &Beef) {
        for entry in &other.txs {
            let txid = self.merge_transaction(&entry.tx);
            if let Some(bump_index) = entry.bump_index {
                let bump = other.bumps[bump_index].clone();
                let new_index = self.merge_bump(bump);
                let index = self.by_txid[&txid];
                self.txs[index].bump_index = Some(new_index);
            }
        }
        for txid in &other.known_txids {
            if !self.known_txids.contains(txid) {
                self.known_txids.push(*txid);
            }
        }
    }

    pub fn merge_beef_bytes(&mut self, bytes: &[u8]) -> Result<(), BeefError> {
        let (other, _) = parse_beef(bytes)?;
        self.merge_beef(&other);
        Ok(())
    }

    pub fn find_transaction(&self, txid: &Txid) -> Option<&Transaction> {
        self.by_txid.get(txid).map(|index| &self.txs[*index].tx)
    }

    pub fn bump_for(&self, txid: &Txid) -> Option<&MerklePath> {
        let entry = &self.txs[*self.by_txid.get(txid)?];
        entry.bump_index.map(|index| &self.bumps[index])
    }

    /// The last transaction added, which by construction is the subject of
    /// a well-formed envelope.
    pub fn last_txid(&self) -> Option<Txid> {
        self.txs.last().map(|entry| entry.tx.compute_txid())
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.txs.iter().map(|entry| &entry.tx)
    }

    /// Resolves the coin `tx`'s input `vin` spends, when its source
    /// transaction travels in this envelope.
    pub fn source_output(&self, tx: &Transaction, vin: usize) -> Option<&TxOut> {
        let input = tx.input.get(vin)?;
        let source = self.find_transaction(&input.previous_output.txid)?;
        source.output.get(input.previous_output.vout as usize)
    }

    /// Serializes ancestors before descendants regardless of merge order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let order = self.topological_order();

        let mut buf = Vec::new();
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut buf, self.bumps.len() as u64);
        for bump in &self.bumps {
            buf.extend_from_slice(&bump.to_bytes());
        }

        let entries = order.len() + if self.version == BEEF_V2 {
            self.known_txids.len()
        } else {
            0
        };
        write_varint(&mut buf, entries as u64);
        if self.version == BEEF_V2 {
            for txid in &self.known_txids {
                buf.push(0x02);
                buf.extend_from_slice(&txid.to_byte_array());
            }
        }
        for index in order {
            let entry = &self.txs[index];
            match self.version {
                BEEF_V2 => match entry.bump_index {
                    Some(bump_index) => {
                        buf.push(0x01);
                        buf.extend_from_slice(&serialize(&entry.tx));
                        write_varint(&mut buf, bump_index as u64);
                    }
                    None => {
                        buf.push(0x00);
                        buf.extend_from_slice(&serialize(&entry.tx));
                    }
                },
                _ => {
                    buf.extend_from_slice(&serialize(&entry.tx));
                    match entry.bump_index {
                        Some(bump_index) => {
                            buf.push(0x01);
                            write_varint(&mut buf, bump_index as u64);
                        }
                        None => buf.push(0x00),
                    }
                }
            }
        }
        buf
    }

    /// Atomic framing: marker, subject txid, then the envelope.
    pub fn to_atomic_bytes(&self, subject: &Txid) -> Result<Vec<u8>, BeefError> {
        if !self.by_txid.contains_key(subject) {
            return Err(BeefError::UnknownSubject(*subject));
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(&ATOMIC_BEEF.to_le_bytes());
        buf.extend_from_slice(&subject.to_byte_array());
        buf.extend_from_slice(&self.to_bytes());
        Ok(buf)
    }

    fn topological_order(&self) -> Vec<usize> {
        let mut emitted: HashSet<usize> = HashSet::new();
        let mut order = Vec::with_capacity(self.txs.len());
        while order.len() < self.txs.len() {
            let mut progressed = false;
            for (index, entry) in self.txs.iter().enumerate() {
                if emitted.contains(&index) {
                    continue;
                }
                let ready = entry.tx.input.iter().all(|input| {
                    match self.by_txid.get(&input.previous_output.txid) {
                        Some(parent) => emitted.contains(parent),
                        None => true,
                    }
                });
                if ready {
                    emitted.insert(index);
                    order.push(index);
                    progressed = true;
                }
            }
            // A dependency cycle cannot happen with real transactions; bail
            // out rather than loop if the envelope is nonsense.
            if !progressed {
                for index in 0..self.txs.len() {
                    if emitted.insert(index) {
                        order.push(index);
                    }
                }
            }
        }
        order
    }
}

/// Parses any of the three framings. For an atomic envelope the committed
/// subject txid is returned alongside the parsed content.
pub fn parse_beef(bytes: &[u8]) -> Result<(Beef, Option<Txid>), BeefError> {
    let mut pos = 0;
    let version = read_u32(bytes, &mut pos)?;

    if version == ATOMIC_BEEF {
        let raw = read_bytes(bytes, &mut pos, 32)?;
        let mut txid = [0u8; 32];
        txid.copy_from_slice(raw);
        let subject = Txid::from_byte_array(txid);
        let (beef, _) = parse_beef(&bytes[pos..])?;
        if beef.find_transaction(&subject).is_none() {
            return Err(BeefError::UnknownSubject(subject));
        }
        return Ok((beef, Some(subject)));
    }

    if version != BEEF_V1 && version != BEEF_V2 {
        return Err(BeefError::UnsupportedVersion(version));
    }

    let mut beef = Beef::new(version);
    let bumps = read_varint(bytes, &mut pos)? as usize;
    for _ in 0..bumps {
        beef.bumps.push(MerklePath::read(bytes, &mut pos)?);
    }

    let entries = read_varint(bytes, &mut pos)? as usize;
    for _ in 0..entries {
        let (tx, bump_index) = if version == BEEF_V2 {
            match read_u8(bytes, &mut pos)? {
                0x02 => {
                    let raw = read_bytes(bytes, &mut pos, 32)?;
                    let mut txid = [0u8; 32];
                    txid.copy_from_slice(raw);
                    beef.known_txids.push(Txid::from_byte_array(txid));
                    continue;
                }
                0x01 => {
                    let tx = read_transaction(bytes, &mut pos)?;
                    let bump_index = read_varint(bytes, &mut pos)?;
                    (tx, Some(bump_index))
                }
                _ => (read_transaction(bytes, &mut pos)?, None),
            }
        } else {
            let tx = read_transaction(bytes, &mut pos)?;
            match read_u8(bytes, &mut pos)? {
                0x01 => {
                    let bump_index = read_varint(bytes, &mut pos)?;
                    (tx, Some(bump_index))
                }
                _ => (tx, None),
            }
        };

        if let Some(bump_index) = bump_index {
            if bump_index as usize >= beef.bumps.len() {
                return Err(BeefError::UnknownBumpIndex(bump_index));
            }
        }
        let txid = beef.merge_transaction(&tx);
        let index = beef.by_txid[&txid];
        beef.txs[index].bump_index = bump_index.map(|b| b as usize);
    }

    Ok((beef, None))
}

fn read_transaction(bytes: &[u8], pos: &mut usize) -> Result<Transaction, BeefError> {
    let (tx, consumed) = deserialize_partial::<Transaction>(&bytes[*pos..])?;
    *pos += consumed;
    Ok(tx)
}

pub(crate) fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub(crate) fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, BeefError> {
    let first = read_u8(bytes, pos)?;
    Ok(match first {
        0xfd => {
            let raw = read_bytes(bytes, pos, 2)?;
            u16::from_le_bytes([raw[0], raw[1]]) as u64
        }
        0xfe => {
            let raw = read_bytes(bytes, pos, 4)?;
            u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64
        }
        0xff => {
            let raw = read_bytes(bytes, pos, 8)?;
            u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ])
        }
        n => n as u64,
    })
}

fn read_u8(bytes: &[u8], pos: &mut usize) -> Result<u8, BeefError> {
    let byte = *bytes.get(*pos).ok_or(BeefError::UnexpectedEof)?;
    *pos += 1;
    Ok(byte)
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32, BeefError> {
    let raw = read_bytes(bytes, pos, 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_bytes<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], BeefError> {
    let raw = bytes
        .get(*pos..*pos + len)
        .ok_or(BeefError::UnexpectedEof)?;
    *pos += len;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::Amount;
    use bitcoin::OutPoint;
    use bitcoin::ScriptBuf;
    use bitcoin::Sequence;
    use bitcoin::TxIn;
    use bitcoin::Witness;

    use super::*;

    fn coinbase_like(tag: u8) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![tag]),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(50),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            }],
        }
    }

    fn child_of(parent: &Transaction, vout: u32) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: parent.compute_txid(),
                    vout,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(49),
                script_pubkey: ScriptBuf::from_bytes(vec![0x52]),
            }],
        }
    }

    #[test]
    fn test_varint_round_trip() {
        for n in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), n);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_merkle_path_two_leaves() {
        let tx = coinbase_like(1);
        let txid = tx.compute_txid();
        let sibling = [0x22u8; 32];

        let path = MerklePath {
            block_height: 800_000,
            path: vec![vec![
                PathLeaf {
                    offset: 0,
                    hash: Some(txid.to_byte_array()),
                    txid: true,
                    duplicate: false,
                },
                PathLeaf {
                    offset: 1,
                    hash: Some(sibling),
                    txid: false,
                    duplicate: false,
                },
            ]],
        };

        assert_eq!(path.block_index_of(&txid), Some(0));

        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&txid.to_byte_array());
        concat[32..].copy_from_slice(&sibling);
        let expected = sha256d::Hash::hash(&concat).to_byte_array();
        assert_eq!(path.compute_root(&txid).unwrap(), expected);

        // Round trip through the wire form.
        let bytes = path.to_bytes();
        let mut pos = 0;
        let parsed = MerklePath::read(&bytes, &mut pos).unwrap();
        assert_eq!(pos, bytes.len());
        assert_eq!(parsed, path);
    }

    #[test]
    fn test_merkle_path_duplicate_sibling() {
        let tx = coinbase_like(2);
        let txid = tx.compute_txid();
        let path = MerklePath {
            block_height: 1,
            path: vec![vec![
                PathLeaf {
                    offset: 0,
                    hash: Some(txid.to_byte_array()),
                    txid: true,
                    duplicate: false,
                },
                PathLeaf {
                    offset: 1,
                    hash: None,
                    txid: false,
                    duplicate: true,
                },
            ]],
        };

        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&txid.to_byte_array());
        concat[32..].copy_from_slice(&txid.to_byte_array());
        assert_eq!(
            path.compute_root(&txid).unwrap(),
            sha256d::Hash::hash(&concat).to_byte_array()
        );

        let unrelated = coinbase_like(3).compute_txid();
        assert!(matches!(
            path.compute_root(&unrelated),
            Err(BeefError::TxidNotInPath(_))
        ));
    }

    #[test]
    fn test_beef_round_trip_v2() {
        let parent = coinbase_like(4);
        let child = child_of(&parent, 0);

        let mut beef = Beef::new(BEEF_V2);
        // Deliberately merged child-first; serialization reorders.
        beef.merge_transaction(&child);
        beef.merge_transaction(&parent);
        let bump = MerklePath {
            block_height: 100,
            path: vec![vec![
                PathLeaf {
                    offset: 0,
                    hash: Some(parent.compute_txid().to_byte_array()),
                    txid: true,
                    duplicate: false,
                },
                PathLeaf {
                    offset: 1,
                    hash: None,
                    txid: false,
                    duplicate: true,
                },
            ]],
        };
        beef.attach_proof(&parent.compute_txid(), bump.clone()).unwrap();

        let bytes = beef.to_bytes();
        let (parsed, subject) = parse_beef(&bytes).unwrap();
        assert_eq!(subject, None);
        assert_eq!(parsed.version, BEEF_V2);
        // The child is the last entry after topological ordering.
        assert_eq!(parsed.last_txid(), Some(child.compute_txid()));
        assert_eq!(parsed.bump_for(&parent.compute_txid()), Some(&bump));
        assert!(parsed.bump_for(&child.compute_txid()).is_none());

        let source = parsed
            .source_output(parsed.find_transaction(&child.compute_txid()).unwrap(), 0)
            .unwrap();
        assert_eq!(source.value, Amount::from_sat(50));
    }

    #[test]
    fn test_beef_round_trip_v1() {
        let tx = coinbase_like(5);
        let mut beef = Beef::new(BEEF_V1);
        beef.merge_transaction(&tx);

        let bytes = beef.to_bytes();
        assert_eq!(&bytes[..4], &BEEF_V1.to_le_bytes());
        let (parsed, _) = parse_beef(&bytes).unwrap();
        assert_eq!(parsed.last_txid(), Some(tx.compute_txid()));
    }

    #[test]
    fn test_atomic_round_trip() {
        let parent = coinbase_like(6);
        let child = child_of(&parent, 0);
        let mut beef = Beef::new(BEEF_V2);
        beef.merge_transaction(&parent);
        let subject = beef.merge_transaction(&child);

        let bytes = beef.to_atomic_bytes(&subject).unwrap();
        let (parsed, committed) = parse_beef(&bytes).unwrap();
        assert_eq!(committed, Some(subject));
        assert!(parsed.find_transaction(&subject).is_some());

        let stranger = coinbase_like(7).compute_txid();
        assert!(matches!(
            beef.to_atomic_bytes(&stranger),
            Err(BeefError::UnknownSubject(_))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_beef(&[0xde, 0xad, 0xbe, 0xef, 0x00]),
            Err(BeefError::UnsupportedVersion(_))
        ));
        assert!(matches!(
            parse_beef(&[0x01, 0x00]),
            Err(BeefError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_merge_beef_carries_proofs() {
        let parent = coinbase_like(8);
        let mut first = Beef::new(BEEF_V2);
        first.merge_transaction(&parent);

        let mut second = Beef::new(BEEF_V2);
        second.merge_transaction(&parent);
        let bump = MerklePath {
            block_height: 7,
            path: vec![vec![
                PathLeaf {
                    offset: 0,
                    hash: Some(parent.compute_txid().to_byte_array()),
                    txid: true,
                    duplicate: false,
                },
                PathLeaf {
                    offset: 1,
                    hash: None,
                    txid: false,
                    duplicate: true,
                },
            ]],
        };
        second.attach_proof(&parent.compute_txid(), bump.clone()).unwrap();

        first.merge_beef_bytes(&second.to_bytes()).unwrap();
        assert_eq!(first.bump_for(&parent.compute_txid()), Some(&bump));
    }
}
