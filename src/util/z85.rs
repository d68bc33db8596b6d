// whirlpool-coordinator-rs
// Copyright (C) 2022  Straylight <straylight_orbit@protonmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Z85 binary-to-text encoding, in the padding-tolerant flavour spoken by Whirlpool clients:
//! a trailing partial chunk of `n` bytes is carried by `n + 1` characters.

const ALPHABET: &[u8; 85] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ.-:+=^!/*?&<>()[]{}@%$#";

/// Highest digit, used to complete a partial chunk when decoding.
const PAD_DIGIT: u64 = 84;

pub fn encode<T: AsRef<[u8]>>(bytes: T) -> String {
    let bytes = bytes.as_ref();
    let mut out = String::with_capacity(bytes.len() / 4 * 5 + 5);

    for chunk in bytes.chunks(4) {
        let mut word = [0_u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        let mut value = u32::from_be_bytes(word);

        let mut digits = [0_u8; 5];
        for digit in digits.iter_mut().rev() {
            *digit = ALPHABET[(value % 85) as usize];
            value /= 85;
        }

        let used = if chunk.len() == 4 { 5 } else { chunk.len() + 1 };
        out.extend(digits[..used].iter().map(|d| *d as char));
    }

    out
}

pub fn decode<T: AsRef<str>>(text: T) -> Option<Vec<u8>> {
    let text = text.as_ref().as_bytes();
    let mut out = Vec::with_capacity(text.len() / 5 * 4 + 4);

    for chunk in text.chunks(5) {
        let mut value: u64 = 0;
        for i in 0..5 {
            let digit = match chunk.get(i) {
                Some(c) => digit_value(*c)?,
                None => PAD_DIGIT,
            };
            value = value * 85 + digit;
        }

        // only the low 32 bits are meaningful once a partial chunk has been padded
        let word = (value as u32).to_be_bytes();
        let used = if chunk.len() == 5 { 4 } else { chunk.len() - 1 };
        out.extend_from_slice(&word[..used]);
    }

    Some(out)
}

fn digit_value(c: u8) -> Option<u64> {
    ALPHABET.iter().position(|a| *a == c).map(|p| p as u64)
}

#[cfg(test)]
mod test {
    #[test]
    fn reference_vector() {
        let bytes = [0x86, 0x4f, 0xd2, 0x6f, 0xb5, 0x59, 0xf7, 0x5b];
        assert_eq!(super::encode(bytes), "HelloWorld");
        assert_eq!(super::decode("HelloWorld").unwrap(), bytes);
    }

    #[test]
    fn partial_chunks() {
        let payload: Vec<u8> = (0_u8..=45).map(|b| b.wrapping_mul(37)).collect();
        for len in [1, 2, 3, 14, 46] {
            let encoded = super::encode(&payload[..len]);
            assert_eq!(encoded.len(), len / 4 * 5 + if len % 4 == 0 { 0 } else { len % 4 + 1 });
            assert_eq!(super::decode(&encoded).unwrap(), &payload[..len]);
        }

        assert_eq!(super::decode(super::encode([0xff])).unwrap(), [0xff]);
    }

    #[test]
    fn rejects_foreign_characters() {
        assert!(super::decode("Hello World").is_none());
        assert!(super::decode("\"abc").is_none());
    }
}
