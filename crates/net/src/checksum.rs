//! Internet checksum (RFC 1071).
//!
//! The sum is accumulated over native-endian machine words, 32 bits at a time
//! once the cursor is 4-byte aligned, so the running value is byte-swapped
//! relative to the wire whenever the buffer starts at an odd address. Every
//! public function returns a host-order value: write it with `to_be_bytes`.

/// Contribution of a lone byte stored at an odd address.
#[inline]
fn odd_lane(byte: u8) -> u32 {
    if cfg!(target_endian = "little") {
        u32::from(byte) << 8
    } else {
        u32::from(byte)
    }
}

/// Contribution of a lone byte stored at an even address.
#[inline]
fn even_lane(byte: u8) -> u32 {
    if cfg!(target_endian = "little") {
        u32::from(byte)
    } else {
        u32::from(byte) << 8
    }
}

#[inline]
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// One's-complement sum of `data`, not complemented, in host order.
pub(crate) fn ones_complement_sum(data: &[u8]) -> u16 {
    let odd_start = (data.as_ptr() as usize) & 1 != 0;
    let mut sum: u32 = 0;
    let mut rest = data;

    if odd_start && let Some((&first, tail)) = rest.split_first() {
        sum += odd_lane(first);
        rest = tail;
    }

    if (rest.as_ptr() as usize) & 2 != 0 && rest.len() >= 2 {
        sum += u32::from(u16::from_ne_bytes([rest[0], rest[1]]));
        rest = &rest[2..];
    }

    let mut words = rest.chunks_exact(4);
    for word in &mut words {
        let value = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]);
        let (next, carry) = sum.overflowing_add(value);
        sum = next + u32::from(carry);
    }
    rest = words.remainder();

    sum = (sum & 0xFFFF) + (sum >> 16);

    if rest.len() >= 2 {
        sum += u32::from(u16::from_ne_bytes([rest[0], rest[1]]));
        rest = &rest[2..];
    }
    if let Some(&last) = rest.first() {
        sum += even_lane(last);
    }

    let mut native = fold(sum);
    if odd_start {
        native = native.swap_bytes();
    }
    u16::from_be(native)
}

/// Checksum of a contiguous region. An empty region yields `0xFFFF`.
pub fn checksum(data: &[u8]) -> u16 {
    !ones_complement_sum(data)
}

/// Sum of `length` bytes starting `offset` bytes into a logically contiguous
/// buffer split across `chunks`, not complemented.
fn scattered_sum<B: AsRef<[u8]>>(chunks: &[B], mut offset: usize, length: usize) -> u32 {
    let mut sum: u32 = 0;
    let mut pos = 0usize;

    for chunk in chunks {
        if pos >= length {
            break;
        }
        let chunk = chunk.as_ref();
        if offset >= chunk.len() {
            offset -= chunk.len();
            continue;
        }

        let n = (chunk.len() - offset).min(length - pos);
        let mut partial = ones_complement_sum(&chunk[offset..offset + n]);
        // A chunk starting at an odd logical position lands in the other
        // byte lane of the 16-bit words.
        if pos & 1 != 0 {
            partial = partial.swap_bytes();
        }
        sum += u32::from(partial);
        sum = u32::from(fold(sum));
        pos += n;
        offset = 0;
    }

    sum
}

/// Checksum over a buffer stored as disjoint chunks.
///
/// Bytes outside the chunks (when `offset + length` runs past them) are
/// ignored.
pub fn checksum_scattered<B: AsRef<[u8]>>(chunks: &[B], offset: usize, length: usize) -> u16 {
    !fold(scattered_sum(chunks, offset, length))
}

/// Checksum of a pseudo-header followed by a contiguous payload.
pub fn upper_layer_checksum(pseudo_header: &[u8], data: &[u8]) -> u16 {
    let sum = u32::from(ones_complement_sum(pseudo_header)) + u32::from(ones_complement_sum(data));
    !fold(sum)
}

/// Checksum of a pseudo-header followed by a scattered payload.
pub fn upper_layer_checksum_scattered<B: AsRef<[u8]>>(
    pseudo_header: &[u8],
    chunks: &[B],
    offset: usize,
    length: usize,
) -> u16 {
    let sum = u32::from(ones_complement_sum(pseudo_header)) + scattered_sum(chunks, offset, length);
    !fold(sum)
}
