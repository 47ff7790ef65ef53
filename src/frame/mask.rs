//! Client-to-server payload masking.

/// XOR `bytes` with `key`, where `bytes[0]` sits at payload position `offset`.
///
/// Masking is its own inverse: applying the same key twice restores the input.
#[inline]
pub fn apply_mask(bytes: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= key[(offset + i) & 3];
    }
}

/// Fresh random masking key.
pub fn random_key() -> [u8; 4] {
    rand::random::<[u8; 4]>()
}
