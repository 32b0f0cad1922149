//! Bitfield packing, least-significant bit first within each byte

/// Packs availability flags into bytes, zero-padding the final byte.
pub fn pack(pieces: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; pieces.len().div_ceil(8)];
    for (index, _) in pieces.iter().enumerate().filter(|(_, has)| **has) {
        bytes[index / 8] |= 1 << (index % 8);
    }
    bytes
}

/// Unpacks bytes into exactly `piece_count` flags.
///
/// Padding bits past `piece_count` are dropped. A payload shorter than the
/// piece count leaves the missing pieces unavailable.
pub fn unpack(bytes: &[u8], piece_count: usize) -> Vec<bool> {
    (0..piece_count)
        .map(|index| {
            bytes
                .get(index / 8)
                .is_some_and(|byte| (byte >> (index % 8)) & 1 == 1)
        })
        .collect()
}
