// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! In-place byte-swap helpers for payloads crossing between hosts of
//! differing byte order. A payload is swapped on the receiving side
//! exactly once, dispatched by its type code.

/// Swaps a 16-bit field in place.
pub fn swap16(bytes: &mut [u8]) {
    debug_assert!(bytes.len() >= 2);
    bytes.swap(0, 1);
}

/// Swaps a 32-bit field in place.
pub fn swap32(bytes: &mut [u8]) {
    debug_assert!(bytes.len() >= 4);
    bytes.swap(0, 3);
    bytes.swap(1, 2);
}

/// Swaps a 64-bit field in place.
pub fn swap64(bytes: &mut [u8]) {
    debug_assert!(bytes.len() >= 8);
    bytes.swap(0, 7);
    bytes.swap(1, 6);
    bytes.swap(2, 5);
    bytes.swap(3, 4);
}

/// Swaps `count` consecutive fields of `width` bytes each.
pub fn swap_fields(bytes: &mut [u8], width: usize, count: usize) {
    debug_assert!(bytes.len() >= width * count);
    for i in 0..count {
        let field = &mut bytes[i * width..(i + 1) * width];
        match width {
            2 => swap16(field),
            4 => swap32(field),
            8 => swap64(field),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap32_identity() {
        let mut b = 0x0102_0304u32.to_le_bytes();
        swap32(&mut b);
        assert_eq!(u32::from_be_bytes(b), 0x0102_0304);
        swap32(&mut b);
        assert_eq!(u32::from_le_bytes(b), 0x0102_0304);
    }

    #[test]
    fn test_swap_scalar() {
        let mut b = 1.5f32.to_le_bytes();
        swap32(&mut b);
        assert_eq!(f32::from_be_bytes(b), 1.5);
    }

    #[test]
    fn test_swap_fields() {
        let mut b = [0u8; 8];
        b[..4].copy_from_slice(&0xAABBCCDDu32.to_le_bytes());
        b[4..].copy_from_slice(&0x11223344u32.to_le_bytes());
        swap_fields(&mut b, 4, 2);
        assert_eq!(u32::from_be_bytes(b[..4].try_into().unwrap()), 0xAABBCCDD);
        assert_eq!(u32::from_be_bytes(b[4..].try_into().unwrap()), 0x11223344);
    }
}
