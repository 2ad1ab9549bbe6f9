//! XOR masking of frame payloads (RFC 6455 Section 5.3).

/// Applies `mask` to `buf` in place. Applying it twice restores the original bytes.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);

    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let value = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) ^ key;
        word.copy_from_slice(&value.to_ne_bytes());
    }
    apply_mask_bytewise(words.into_remainder(), mask);
}

/// Byte-at-a-time masking, used for the tail that does not fill a whole word.
#[inline]
fn apply_mask_bytewise(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}
