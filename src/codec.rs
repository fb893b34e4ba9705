//! Base64 codec and UTF-8 validation.
//!
//! Base64 encode/decode operate in place on caller-owned buffers, mirroring
//! the teacher's preference for allocation-free, table-driven byte
//! transforms (see `http::types::to_lower_case`). UTF-8 validation uses the
//! Hoehrmann DFA rather than a SIMD crate, since the exact algorithm is a
//! spec'd, independently testable operation.

use crate::errors::CodecError;

#[rustfmt::skip]
const ENCODE_TABLE: [u8; 64] = [
    b'A', b'B', b'C', b'D', b'E', b'F', b'G', b'H', b'I', b'J', b'K', b'L', b'M',
    b'N', b'O', b'P', b'Q', b'R', b'S', b'T', b'U', b'V', b'W', b'X', b'Y', b'Z',
    b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', b'k', b'l', b'm',
    b'n', b'o', b'p', b'q', b'r', b's', b't', b'u', b'v', b'w', b'x', b'y', b'z',
    b'0', b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'+', b'/',
];

const INVALID: u8 = 0xFF;
const PAD: u8 = 0xFE;

#[rustfmt::skip]
const DECODE_TABLE: [u8; 256] = {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < 64 {
        table[ENCODE_TABLE[i] as usize] = i as u8;
        i += 1;
    }
    table[b'=' as usize] = PAD;
    table
};

/// Decodes base64 in place. `buf[..n]` is consumed and overwritten with the
/// decoded bytes; returns the decoded length.
///
/// Fails if `n % 4 != 0`, if a non-alphabet byte appears in a non-terminal
/// position, or if `=` padding violates the canonical 0/1/2-padding rule
/// (`"xx=="` -> 1 byte, `"xxx="` -> 2 bytes, `"xxxx"` -> 3 bytes).
pub fn base64_decode_in_place(buf: &mut [u8]) -> Result<usize, CodecError> {
    let n = buf.len();
    if n % 4 != 0 {
        return Err(CodecError::InvalidLength);
    }
    if n == 0 {
        return Ok(0);
    }

    let mut out = 0usize;
    let last_block = n - 4;
    let mut block = 0;
    while block < n {
        let is_last = block == last_block;
        let quad = [
            buf[block],
            buf[block + 1],
            buf[block + 2],
            buf[block + 3],
        ];
        let mapped = quad.map(|b| DECODE_TABLE[b as usize]);

        if mapped.iter().any(|&m| m == INVALID) {
            return Err(CodecError::InvalidByte);
        }

        let pad_count = if is_last {
            match (mapped[2] == PAD, mapped[3] == PAD) {
                (false, false) => 0,
                (false, true) => 1,
                (true, true) => 2,
                (true, false) => return Err(CodecError::InvalidPadding),
            }
        } else {
            if mapped.iter().any(|&m| m == PAD) {
                return Err(CodecError::InvalidPadding);
            }
            0
        };
        if mapped[0] == PAD || mapped[1] == PAD {
            return Err(CodecError::InvalidPadding);
        }

        let b0 = if mapped[0] == PAD { 0 } else { mapped[0] };
        let b1 = if mapped[1] == PAD { 0 } else { mapped[1] };
        let b2 = if mapped[2] == PAD { 0 } else { mapped[2] };
        let b3 = if mapped[3] == PAD { 0 } else { mapped[3] };

        let triple = [
            (b0 << 2) | (b1 >> 4),
            (b1 << 4) | (b2 >> 2),
            (b2 << 6) | b3,
        ];

        let emit = 3 - pad_count;
        buf[out..out + emit].copy_from_slice(&triple[..emit]);
        out += emit;
        block += 4;
    }

    Ok(out)
}

/// Encodes `buf[..len]` as base64 in place, growing `buf` and writing
/// backward from the end so no scratch buffer is required.
pub fn base64_encode_in_place(buf: &mut Vec<u8>, len: usize) -> Result<(), CodecError> {
    let groups = len.div_ceil(3);
    let encoded_len = groups.checked_mul(4).ok_or(CodecError::Overflow)?;

    let pad = match len % 3 {
        0 => 0,
        1 => 2,
        2 => 1,
        _ => unreachable!(),
    };

    buf.resize(encoded_len, 0);

    let mut read = len;
    let mut write = encoded_len;
    while write > 0 {
        write -= 4;

        let b2 = if read >= 1 { buf[read - 1] } else { 0 };
        let b1 = if read >= 2 { buf[read - 2] } else { 0 };
        let b0 = if read >= 3 { buf[read - 3] } else { 0 };
        read = read.saturating_sub(3);

        let c0 = b0 >> 2;
        let c1 = ((b0 & 0x03) << 4) | (b1 >> 4);
        let c2 = ((b1 & 0x0F) << 2) | (b2 >> 6);
        let c3 = b2 & 0x3F;

        buf[write] = ENCODE_TABLE[c0 as usize];
        buf[write + 1] = ENCODE_TABLE[c1 as usize];
        buf[write + 2] = if write + 2 >= encoded_len - pad {
            b'='
        } else {
            ENCODE_TABLE[c2 as usize]
        };
        buf[write + 3] = if write + 3 >= encoded_len - pad {
            b'='
        } else {
            ENCODE_TABLE[c3 as usize]
        };
    }

    Ok(())
}

/// Convenience wrapper returning a fresh `Vec<u8>`.
pub fn base64_encode(input: &[u8]) -> Vec<u8> {
    let mut buf = input.to_vec();
    base64_encode_in_place(&mut buf, input.len()).expect("base64 length never overflows in practice");
    buf
}

// UTF-8 validation: Hoehrmann DFA.
// https://bjoern.hoehrmann.de/utf-8/decoder/dfa/

const UTF8_ACCEPT: u8 = 0;
const UTF8_REJECT: u8 = 1;

#[rustfmt::skip]
const UTF8_CLASSES: [u8; 256] = [
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,
    9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,
    7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,
    8,8,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
    10,3,3,3,3,3,3,3,3,3,3,3,3,4,3,3,11,6,6,6,5,8,8,8,8,8,8,8,8,8,8,8,
];

#[rustfmt::skip]
const UTF8_TRANSITIONS: [u8; 108] = [
    0,12,24,36,60,96,84,12,12,12,48,72, 12,12,12,12,12,12,12,12,12,12,12,12,
    12, 0,12,12,12,12,12, 0,12, 0,12,12, 12,24,12,12,12,12,12,24,12,24,12,12,
    12,12,12,12,12,12,12,24,12,12,12,12, 12,24,12,12,12,12,12,12,12,24,12,12,
    12,12,12,12,12,12,12,36,12,36,12,12, 12,36,12,12,12,12,12,36,12,36,12,12,
    12,36,12,12,12,12,12,12,12,12,12,12,
];

/// Validates that `data` is well-formed UTF-8 using a byte-at-a-time DFA
/// walk. Equivalent to `std::str::from_utf8(data).is_ok()` but implemented
/// per spec as a standalone, independently testable operation.
pub fn validate_utf8(data: &[u8]) -> bool {
    let mut state = UTF8_ACCEPT;
    for &byte in data {
        let class = UTF8_CLASSES[byte as usize];
        state = UTF8_TRANSITIONS[(state as usize) + class as usize];
        if state == UTF8_REJECT {
            return false;
        }
    }
    state == UTF8_ACCEPT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(s: &str) -> Result<Vec<u8>, CodecError> {
        let mut buf = s.as_bytes().to_vec();
        let len = base64_decode_in_place(&mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    #[test]
    fn encode_concrete_vectors() {
        assert_eq!(base64_encode(b"f"), b"Zg==");
        assert_eq!(base64_encode(b"fo"), b"Zm8=");
        assert_eq!(base64_encode(b"foo"), b"Zm9v");
        assert_eq!(base64_encode(b"foobar"), b"Zm9vYmFy");
        assert_eq!(base64_encode(b"hello"), b"aGVsbG8=");
    }

    #[test]
    fn roundtrip() {
        for input in [&b""[..], b"f", b"fo", b"foo", b"foobar", b"\x00\xff\x10hello world"] {
            let encoded = base64_encode(input);
            let decoded = decode(std::str::from_utf8(&encoded).unwrap()).unwrap();
            assert_eq!(decoded, input);
        }
    }

    #[test]
    fn decode_invalid_alphabet() {
        assert_eq!(decode("!!!!"), Err(CodecError::InvalidByte));
    }

    #[test]
    fn decode_bad_length() {
        assert_eq!(decode("abc").unwrap_err(), CodecError::InvalidLength);
        assert_eq!(decode("abcde").unwrap_err(), CodecError::InvalidLength);
    }

    #[test]
    fn decode_padding_tie_break() {
        assert_eq!(decode("xx==").unwrap().len(), 1);
        assert_eq!(decode("xxx=").unwrap().len(), 2);
        assert_eq!(decode("xxxx").unwrap().len(), 3);
    }

    #[test]
    fn decode_padding_in_wrong_position_fails() {
        assert!(decode("x=xx").is_err());
        assert!(decode("=xxx").is_err());
    }

    #[test]
    fn utf8_valid_sequences() {
        assert!(validate_utf8(&[0xE2, 0x82, 0xAC])); // EURO SIGN
        assert!(validate_utf8(&[0xF0, 0x9F, 0x98, 0x80])); // EMOJI
        assert!(validate_utf8(b"plain ascii"));
        assert!(validate_utf8(b""));
    }

    #[test]
    fn utf8_invalid_sequences() {
        assert!(!validate_utf8(&[0x80, 0x80]));
        assert!(!validate_utf8(&[0xC2]));
    }
}
