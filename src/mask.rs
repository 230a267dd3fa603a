//! WebSocket frame masking utilities
//!
//! Masking and unmasking are the same operation: XOR with a repeating 4-byte key.
//! Client frames are always masked, so the key is drawn from `rand` for every frame.

use rand::RngCore;

/// Apply a WebSocket mask in place
///
/// XORs `data` with the repeating 4-byte `mask`, starting at key phase 0.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(data, mask, 0);
}

/// Apply a WebSocket mask in place, starting at key phase `offset`
///
/// Used when a payload is masked in several pieces (partial reads).
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    if data.is_empty() {
        return;
    }

    // Rotate the key so that chunk-wise XOR starts at the right phase
    let shift = offset & 3;
    let rotated = [
        mask[shift],
        mask[(shift + 1) & 3],
        mask[(shift + 2) & 3],
        mask[(shift + 3) & 3],
    ];

    let mask_u64 = u64::from_ne_bytes([
        rotated[0], rotated[1], rotated[2], rotated[3], rotated[0], rotated[1], rotated[2],
        rotated[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i & 3];
    }
}

/// Generate a random mask for a client frame
#[inline]
pub fn generate_mask() -> [u8; 4] {
    let mut buf = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_mask(data: &[u8], mask: [u8; 4], offset: usize) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[(i + offset) & 3])
            .collect()
    }

    #[test]
    fn test_mask_matches_reference() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        for len in [0usize, 1, 3, 4, 7, 8, 9, 15, 16, 17, 63, 64, 65, 1000] {
            let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let mut masked = data.clone();
            apply_mask(&mut masked, mask);
            assert_eq!(masked, reference_mask(&data, mask, 0), "len {len}");
        }
    }

    #[test]
    fn test_mask_roundtrip() {
        for seed in 0u8..16 {
            let mask = [seed, seed.wrapping_mul(7), 0xff - seed, 0x5a];
            let payload: Vec<u8> = (0..(seed as usize * 37 + 5)).map(|i| i as u8).collect();
            let mut data = payload.clone();
            apply_mask(&mut data, mask);
            apply_mask(&mut data, mask);
            assert_eq!(data, payload);
        }
    }

    #[test]
    fn test_mask_in_pieces() {
        let mask = [1, 2, 3, 4];
        let data: Vec<u8> = (0..50).collect();
        let mut whole = data.clone();
        apply_mask(&mut whole, mask);

        let mut pieces = data.clone();
        let (a, b) = pieces.split_at_mut(13);
        apply_mask_offset(a, mask, 0);
        apply_mask_offset(b, mask, 13);
        assert_eq!(pieces, whole);
    }

    #[test]
    fn test_generate_mask_varies() {
        let masks: Vec<[u8; 4]> = (0..8).map(|_| generate_mask()).collect();
        assert!(masks.windows(2).any(|w| w[0] != w[1]));
    }
}
