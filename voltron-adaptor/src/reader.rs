// Helper functions for decoding target words from raw memory

use bytes::Buf;

use crate::error::{AdaptorError, AdaptorResult};
use crate::types::ByteOrder;

/// Read one pointer-sized word honouring the target's byte order
pub fn read_word(buf: &mut &[u8], addr_size: u8, byte_order: ByteOrder) -> AdaptorResult<u64> {
    let needed = addr_size as usize;
    if buf.remaining() < needed {
        return Err(AdaptorError::host(format!(
            "Not enough data for a {}-byte word: got {}",
            needed,
            buf.remaining()
        )));
    }

    let word = match (addr_size, byte_order) {
        (2, ByteOrder::Little) => buf.get_u16_le() as u64,
        (2, ByteOrder::Big) => buf.get_u16() as u64,
        (4, ByteOrder::Little) => buf.get_u32_le() as u64,
        (4, ByteOrder::Big) => buf.get_u32() as u64,
        (8, ByteOrder::Little) => buf.get_u64_le(),
        (8, ByteOrder::Big) => buf.get_u64(),
        (other, _) => {
            return Err(AdaptorError::host(format!("Unsupported address size: {}", other)));
        }
    };

    Ok(word)
}

/// Split a memory block into words. A trailing partial word is ignored.
pub fn read_words(data: &[u8], addr_size: u8, byte_order: ByteOrder) -> AdaptorResult<Vec<u64>> {
    let mut buf = data;
    let mut words = Vec::with_capacity(data.len() / addr_size.max(1) as usize);
    while buf.remaining() >= addr_size as usize {
        words.push(read_word(&mut buf, addr_size, byte_order)?);
    }
    Ok(words)
}

/// Encode a word the way the target stores it
pub fn encode_word(value: u64, addr_size: u8, byte_order: ByteOrder) -> Vec<u8> {
    let bytes = match byte_order {
        ByteOrder::Little => value.to_le_bytes(),
        ByteOrder::Big => value.to_be_bytes(),
    };
    let size = addr_size as usize;
    match byte_order {
        ByteOrder::Little => bytes[..size].to_vec(),
        ByteOrder::Big => bytes[8 - size..].to_vec(),
    }
}
