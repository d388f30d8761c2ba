#![allow(unused)]

// Convention from https://serde.rs/conventions.html
mod decode;
mod encode;
mod error;
mod token;

pub use decode::{decode_bytes, decode_str, DecodedType};
pub use encode::{encode_to_raw, encode_to_string};
pub use error::{Error, Result};
pub use token::Token;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Inner {
        #[serde(with = "serde_bytes")]
        pieces: Vec<u8>,
        #[serde(rename = "piece length")]
        piece_length: u32,
    }

    #[test]
    fn round_trip_struct() {
        let inner = Inner {
            pieces: vec![1, 2, 3, 4, 5],
            piece_length: 16_384,
        };
        let encoded = encode_to_raw(&inner).unwrap();
        let decoded: Inner = decode_bytes(&encoded).unwrap();
        assert_eq!(inner, decoded);
    }
}
