// Pointer-chain dereference
//
// Follows a pointer through memory one word at a time and annotates where
// the chain ends up: a symbol, an ASCII string, a "simple" UTF-16 string
// (ASCII interleaved with NULs), or a cycle.
//
// The walk is host independent. Adaptors expose their memory through
// `MemorySource` and call `dereference` while holding their host lock.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{AdaptorError, AdaptorResult};
use crate::reader::read_word;
use crate::types::{ByteOrder, DerefChain, DerefNode};

pub const DEFAULT_MAX_DEREF: usize = 16;
pub const DEFAULT_MAX_STRING: usize = 128;
const MIN_STRING: usize = 4;

/// Read access to target memory as needed by the dereference walk
pub trait MemorySource {
    fn addr_size(&self) -> u8;
    fn byte_order(&self) -> ByteOrder;

    /// Read exactly `length` bytes, or `None` if any part is unmapped
    fn read(&self, address: u64, length: u64) -> Option<Vec<u8>>;

    /// "name + 0xoffset" for an address inside a known symbol
    fn symbolicate(&self, address: u64) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerefLimits {
    /// Upper bound on the chain length, terminal node included. A chain
    /// always holds at least the first pointer, so 0 acts as 1.
    pub max_deref: usize,
    /// Upper bound on bytes examined when sniffing for a string
    pub max_string: usize,
}

impl Default for DerefLimits {
    fn default() -> Self {
        Self {
            max_deref: DEFAULT_MAX_DEREF,
            max_string: DEFAULT_MAX_STRING,
        }
    }
}

/// Build the dereference chain for `pointer`.
///
/// Fails with [`AdaptorError::InvalidPointer`] when not even the first word
/// can be read.
pub fn dereference<M: MemorySource + ?Sized>(
    mem: &M,
    pointer: u64,
    limits: DerefLimits,
) -> AdaptorResult<DerefChain> {
    let addr_size = mem.addr_size();
    let byte_order = mem.byte_order();
    let cap = limits.max_deref.max(1);
    // Leave room for the terminal node when the cap allows one
    let max_hops = cap.saturating_sub(1).max(1);

    let mut chain = DerefChain::new();
    let mut seen = HashSet::new();
    let mut addr = pointer;

    for _ in 0..max_hops {
        let value = match mem
            .read(addr, addr_size as u64)
            .and_then(|bytes| read_word(&mut bytes.as_slice(), addr_size, byte_order).ok())
        {
            Some(value) => value,
            None => break,
        };

        chain.push(DerefNode::Pointer(addr));
        seen.insert(addr);

        if seen.contains(&value) {
            if chain.len() < cap {
                chain.push(DerefNode::Circular);
            }
            break;
        }
        addr = value;
    }

    let last = match chain.last() {
        None => return Err(AdaptorError::InvalidPointer(pointer)),
        Some(DerefNode::Pointer(last)) => *last,
        Some(_) => return Ok(chain),
    };
    if chain.len() >= cap {
        return Ok(chain);
    }

    if let Some(symbol) = mem.symbolicate(last) {
        chain.push(DerefNode::Symbol(symbol));
    } else if let Some(s) = ascii_string(mem, last, limits.max_string) {
        chain.push(DerefNode::String(s));
    } else if let Some(s) = unicode_string(mem, last, limits.max_string) {
        chain.push(DerefNode::Unicode(s));
    }

    debug!("chain for 0x{:x}: {:?}", pointer, chain);
    Ok(chain)
}

fn is_printable(b: u8) -> bool {
    (0x20..=0x7e).contains(&b) || b == b'\t' || b == b'\n' || b == b'\r'
}

/// Read up to `max` bytes, stopping early at the first unreadable byte
fn read_prefix<M: MemorySource + ?Sized>(mem: &M, address: u64, max: usize) -> Vec<u8> {
    if let Some(bytes) = mem.read(address, max as u64) {
        return bytes;
    }

    let mut out = Vec::new();
    for i in 0..max as u64 {
        match mem.read(address.wrapping_add(i), 1) {
            Some(b) => out.extend_from_slice(&b),
            None => break,
        }
    }
    out
}

/// A printable run of at least four bytes, ended by NUL or a non-printable byte
fn ascii_string<M: MemorySource + ?Sized>(mem: &M, address: u64, max: usize) -> Option<String> {
    let bytes = read_prefix(mem, address, max);
    let run: Vec<u8> = bytes.into_iter().take_while(|b| is_printable(*b)).collect();

    if run.len() >= MIN_STRING {
        Some(String::from_utf8_lossy(&run).into_owned())
    } else {
        None
    }
}

/// ASCII characters each followed by a NUL byte, at least four of them
fn unicode_string<M: MemorySource + ?Sized>(mem: &M, address: u64, max: usize) -> Option<String> {
    let bytes = read_prefix(mem, address, max);
    let mut s = String::new();

    for pair in bytes.chunks_exact(2) {
        let (c, hi) = (pair[0], pair[1]);
        if hi != 0 || c == 0 || !is_printable(c) {
            break;
        }
        s.push(c as char);
    }

    if s.len() >= MIN_STRING {
        Some(s)
    } else {
        None
    }
}
