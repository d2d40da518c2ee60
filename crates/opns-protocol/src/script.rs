//! Locking-script codec for the OpNS contract.
//!
//! A frontier output's script is the compiled contract bytecode followed by a
//! state segment: `OP_RETURN OP_FALSE`, then four data pushes (the genesis
//! outpoint, the claimed-characters bitmap, the domain mined so far and the
//! proof-of-work hash of the producing spend), then a little-endian length
//! word and a zero terminator. Decoding is positional and ignores the length
//! word.
//!
//! The claim itself lives in a separate inscription output: an ordinals
//! envelope with MIME type `application/op-ns` whose content is the domain,
//! prefixed by whatever spending condition the owner chose.

use std::sync::OnceLock;

use bitcoin::hashes::hex::FromHex;
use bitcoin::opcodes::all::OP_ENDIF;
use bitcoin::opcodes::all::OP_IF;
use bitcoin::opcodes::all::OP_PUSHNUM_1;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::Address;
use bitcoin::Network;
use bitcoin::Script;
use bitcoin::ScriptBuf;

use crate::genesis;

/// MIME type that marks an inscription as an OpNS claim.
pub const OPNS_CONTENT_TYPE: &str = "application/op-ns";

/// Address pushed after the inscription envelope so indexers can find claims
/// by a single well-known marker.
pub const MARKER_ADDRESS: &str = "1opNSUJVbBc2Vf8LFNSoywGGK4jMcGVrC";

/// Compiled bytecode of the proof-of-work name contract, as deployed on
/// chain. The overlay never executes it; decoding only compares against it
/// as a byte prefix.
const CONTRACT_PREFIX_HEX: &str = "0164635479547a75547a547a547a547a61577a75577a577a577a577a577a577a\
5779a954798769587954790128947f77587a75587a587a587a587a587a587a7e\
5579aa7c8769009f6301007e817f7c7e7b8b7c7e7e7c567a75567a567a567a56\
7a567a75757575756151795179a26975537a75537a537a537a5161777777";

/// Leading bytecode of the ordinal-lock listing contract. Recognition only;
/// the sale terms that follow it are opaque to the overlay.
const ORD_LOCK_PREFIX_HEX: &str = "2097dfd76851bf465e8f715593b217714858bbe9570ff3bd5e33840a34e20ff0\
26102ba79df205a1a7cc7f712086c926a5eb6a319f87d30bccb9b115fc47a2ed";

pub fn contract_prefix() -> &'static [u8] {
    static PREFIX: OnceLock<Vec<u8>> = OnceLock::new();
    PREFIX.get_or_init(|| Vec::from_hex(CONTRACT_PREFIX_HEX).expect("hardcoded contract bytecode"))
}

pub fn ord_lock_prefix() -> &'static [u8] {
    static PREFIX: OnceLock<Vec<u8>> = OnceLock::new();
    PREFIX.get_or_init(|| Vec::from_hex(ORD_LOCK_PREFIX_HEX).expect("hardcoded ord-lock bytecode"))
}

/// Decoded state of a frontier output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opns {
    /// Little-endian bitmap of next-characters already mined off this
    /// frontier. Bit `c` set means a child frontier exists for
    /// `domain ‖ c`.
    pub claimed: Vec<u8>,
    /// The prefix mined so far. Empty for the root frontier.
    pub domain: String,
    /// Hash of the proof-of-work that produced this output. The next miner
    /// must extend it.
    pub pow: Vec<u8>,
    /// The full script this state was decoded from.
    pub locking_script: ScriptBuf,
}

impl Opns {
    /// Reads the state segment back out of a locking script. Returns `None`
    /// for anything that is not an OpNS frontier: wrong contract bytecode,
    /// wrong genesis reference, or a missing/mis-shaped push.
    pub fn decode(script: &Script) -> Option<Opns> {
        let bytes = script.as_bytes();
        let prefix = contract_prefix();
        if !bytes.starts_with(prefix) {
            return None;
        }
        let mut pos = prefix.len();
        if bytes.get(pos) != Some(&OP_RETURN.to_u8()) || bytes.get(pos + 1) != Some(&0x00) {
            return None;
        }
        pos += 2;

        let genesis_bytes = read_push(bytes, &mut pos)?;
        if genesis_bytes != genesis().to_bytes() {
            return None;
        }
        let claimed = read_push(bytes, &mut pos)?;
        let domain = String::from_utf8(read_push(bytes, &mut pos)?).ok()?;
        let pow = read_push(bytes, &mut pos)?;
        if pow.len() != 32 {
            return None;
        }

        Some(Opns {
            claimed,
            domain,
            pow,
            locking_script: script.to_owned(),
        })
    }

    /// Builds a frontier locking script for the given state.
    ///
    /// When the most significant byte of the bitmap has its high bit set, a
    /// zero sign-extension byte is appended so the contract reads the bitmap
    /// as an unsigned number.
    pub fn lock(claimed: &[u8], domain: &str, pow: &[u8]) -> ScriptBuf {
        let mut claimed = claimed.to_vec();
        if claimed.last().is_some_and(|byte| byte & 0x80 != 0) {
            claimed.push(0x00);
        }

        let mut state = vec![OP_RETURN.to_u8(), 0x00];
        append_push(&mut state, &genesis().to_bytes());
        append_push(&mut state, &claimed);
        append_push(&mut state, domain.as_bytes());
        append_push(&mut state, pow);

        // The trailer counts the bytes appended after OP_RETURN. The decoder
        // never reads it; the contract does.
        let state_size = (state.len() - 1) as u32;
        state.extend_from_slice(&state_size.to_le_bytes());
        state.push(0x00);

        let mut script = contract_prefix().to_vec();
        script.extend_from_slice(&state);
        ScriptBuf::from_bytes(script)
    }

    /// Whether character `ch` has already been mined off this frontier.
    pub fn is_claimed(&self, ch: u8) -> bool {
        claimed_bit(&self.claimed, ch)
    }
}

pub fn claimed_bit(claimed: &[u8], ch: u8) -> bool {
    claimed
        .get(ch as usize / 8)
        .is_some_and(|byte| byte & (1 << (ch % 8)) != 0)
}

/// Returns a copy of the bitmap with bit `ch` set, growing it as needed.
pub fn set_claimed_bit(claimed: &[u8], ch: u8) -> Vec<u8> {
    let mut out = claimed.to_vec();
    let index = ch as usize / 8;
    if out.len() <= index {
        out.resize(index + 1, 0);
    }
    out[index] |= 1 << (ch % 8);
    out
}

/// An ordinals envelope found inside a locking script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inscription {
    pub content_type: String,
    pub content: Vec<u8>,
    /// Script bytes before `OP_FALSE OP_IF` — the owner's spending
    /// condition when the envelope was appended to one.
    pub script_prefix: Vec<u8>,
    /// Script bytes after `OP_ENDIF`.
    pub script_suffix: Vec<u8>,
}

/// Finds and parses an ordinals envelope anywhere in `script`.
pub fn decode_inscription(script: &Script) -> Option<Inscription> {
    let bytes = script.as_bytes();
    // OP_FALSE OP_IF push("ord")
    const MARKER: [u8; 6] = [0x00, 0x63, 0x03, b'o', b'r', b'd'];
    let start = bytes
        .windows(MARKER.len())
        .position(|window| window == MARKER)?;

    let mut pos = start + MARKER.len();
    let mut content_type = None;
    let mut content = None;
    loop {
        match bytes.get(pos)? {
            op if *op == OP_ENDIF.to_u8() => {
                pos += 1;
                break;
            }
            op if *op == OP_PUSHNUM_1.to_u8() => {
                pos += 1;
                content_type = Some(read_push(bytes, &mut pos)?);
            }
            0x00 => {
                pos += 1;
                content = Some(read_push(bytes, &mut pos)?);
            }
            _ => return None,
        }
    }

    Some(Inscription {
        content_type: String::from_utf8(content_type?).ok()?,
        content: content?,
        script_prefix: bytes[..start].to_vec(),
        script_suffix: bytes[pos..].to_vec(),
    })
}

/// Builds the inscription output script claiming `domain` under
/// `owner_script`: the owner's spending condition, the envelope, and an
/// `OP_RETURN` trailer carrying the marker address and the genesis bytes.
pub fn build_inscription(domain: &str, owner_script: &Script) -> ScriptBuf {
    let mut script = owner_script.as_bytes().to_vec();
    script.push(0x00);
    script.push(OP_IF.to_u8());
    append_push(&mut script, b"ord");
    script.push(OP_PUSHNUM_1.to_u8());
    append_push(&mut script, OPNS_CONTENT_TYPE.as_bytes());
    script.push(0x00);
    append_push(&mut script, domain.as_bytes());
    script.push(OP_ENDIF.to_u8());
    script.push(OP_RETURN.to_u8());
    append_push(&mut script, MARKER_ADDRESS.as_bytes());
    append_push(&mut script, &genesis().to_bytes());
    ScriptBuf::from_bytes(script)
}

/// Extracts the address of a standard pay-to-public-key-hash script.
pub fn decode_p2pkh(script: &Script) -> Option<String> {
    if !script.is_p2pkh() {
        return None;
    }
    Address::from_script(script, Network::Bitcoin)
        .ok()
        .map(|address| address.to_string())
}

pub fn is_ord_lock(script: &Script) -> bool {
    script.as_bytes().starts_with(ord_lock_prefix())
}

/// Tagged classification of an output script, most specific shape first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedScript {
    Frontier(Opns),
    Inscription(Inscription),
    P2pkh(String),
    OrdLock,
    Unknown,
}

pub fn classify(script: &Script) -> DecodedScript {
    if let Some(opns) = Opns::decode(script) {
        return DecodedScript::Frontier(opns);
    }
    if let Some(inscription) = decode_inscription(script) {
        return DecodedScript::Inscription(inscription);
    }
    if let Some(address) = decode_p2pkh(script) {
        return DecodedScript::P2pkh(address);
    }
    if is_ord_lock(script) {
        return DecodedScript::OrdLock;
    }
    DecodedScript::Unknown
}

/// Appends `data` with the shortest push prefix that can carry it.
pub(crate) fn append_push(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(0x00),
        len @ 1..=0x4b => {
            script.push(len as u8);
        }
        len @ 0x4c..=0xff => {
            script.push(0x4c);
            script.push(len as u8);
        }
        len @ 0x100..=0xffff => {
            script.push(0x4d);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            script.push(0x4e);
            script.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

/// Reads one data push at `*pos`, advancing past it. `None` if the byte at
/// `*pos` is not a push opcode or the payload is truncated.
pub(crate) fn read_push(bytes: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let opcode = *bytes.get(*pos)?;
    *pos += 1;
    let len = match opcode {
        0x00 => 0,
        1..=0x4b => opcode as usize,
        0x4c => {
            let len = *bytes.get(*pos)? as usize;
            *pos += 1;
            len
        }
        0x4d => {
            let raw = bytes.get(*pos..*pos + 2)?;
            *pos += 2;
            u16::from_le_bytes([raw[0], raw[1]]) as usize
        }
        0x4e => {
            let raw = bytes.get(*pos..*pos + 4)?;
            *pos += 4;
            u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
        }
        _ => return None,
    };
    let data = bytes.get(*pos..*pos + len)?.to_vec();
    *pos += len;
    Some(data)
}
