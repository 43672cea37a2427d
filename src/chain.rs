//! On-chain wire types and call-data encoding.
//!
//! The engine never signs or broadcasts anything itself; it only prepares
//! ABI-encoded call data for the wallet bridge. Three calls exist:
//! `approve` on the stablecoin contract and `mint`/`mintBatch` on the two
//! purchase contracts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::usdc::Usdc;

/// `approve(address,uint256)`
const APPROVE_SELECTOR: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];
/// `mint(address,uint256,bytes)`
const MINT_SELECTOR: [u8; 4] = [0x94, 0xd0, 0x08, 0xef];
/// `mintBatch(address,uint256[],uint256[],bytes)`
const MINT_BATCH_SELECTOR: [u8; 4] = [0xd8, 0x1d, 0x0a, 0x15];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HexError {
    #[error("invalid hex digit in {0}")]
    InvalidDigit(String),
    #[error("expected {expected} hex chars, got {got}")]
    BadLength { expected: usize, got: usize },
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, HexError> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    if stripped.len() % 2 != 0 {
        return Err(HexError::InvalidDigit(raw.to_string()));
    }

    (0..stripped.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&stripped[i..i + 2], 16)
                .map_err(|_| HexError::InvalidDigit(raw.to_string()))
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    use fmt::Write as _;

    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

macro_rules! hex_string_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// A 20-byte account or contract address, always rendered lowercase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl FromStr for Address {
    type Err = HexError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(raw.trim())?;
        let got = bytes.len() * 2;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| HexError::BadLength { expected: 40, got })?;
        Ok(Address(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

hex_string_serde!(Address);

/// A 32-byte token id as issued by the backend (`onchainId`, zodiac piece
/// ids). Short hex strings are left-padded into the word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TokenId(pub [u8; 32]);

impl TokenId {
    /// The id without the `0x` prefix, as used in metadata blob paths.
    pub fn bare_hex(&self) -> String {
        encode_hex(&self.0).split_off(2)
    }
}

impl FromStr for TokenId {
    type Err = HexError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(raw.trim())?;
        if bytes.len() > 32 {
            return Err(HexError::BadLength {
                expected: 64,
                got: bytes.len() * 2,
            });
        }
        let mut word = [0u8; 32];
        word[32 - bytes.len()..].copy_from_slice(&bytes);
        Ok(TokenId(word))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

hex_string_serde!(TokenId);

/// A 32-byte transaction hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxHash(pub [u8; 32]);

impl FromStr for TxHash {
    type Err = HexError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(raw.trim())?;
        let got = bytes.len() * 2;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| HexError::BadLength { expected: 64, got })?;
        Ok(TxHash(bytes))
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

hex_string_serde!(TxHash);

/// Arbitrary hex-encoded bytes: signed authorization payloads from the
/// backend and the call data we hand to the wallet bridge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

impl FromStr for HexBytes {
    type Err = HexError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        decode_hex(raw.trim()).map(HexBytes)
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

hex_string_serde!(HexBytes);

/// One ABI argument. Static values occupy a head word; dynamic values are
/// referenced from the head by byte offset and laid out in the tail.
enum AbiToken {
    Word([u8; 32]),
    Bytes(Vec<u8>),
    WordArray(Vec<[u8; 32]>),
}

impl AbiToken {
    fn address(address: Address) -> Self {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&address.0);
        AbiToken::Word(word)
    }

    fn uint(value: u128) -> Self {
        AbiToken::Word(uint_word(value))
    }
}

fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn encode_call(selector: [u8; 4], tokens: &[AbiToken]) -> HexBytes {
    let head_len = 32 * tokens.len();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        match token {
            AbiToken::Word(word) => head.extend_from_slice(word),
            AbiToken::Bytes(bytes) => {
                head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
                tail.extend_from_slice(&uint_word(bytes.len() as u128));
                tail.extend_from_slice(bytes);
                tail.resize(tail.len().div_ceil(32) * 32, 0);
            }
            AbiToken::WordArray(words) => {
                head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
                tail.extend_from_slice(&uint_word(words.len() as u128));
                for word in words {
                    tail.extend_from_slice(word);
                }
            }
        }
    }

    let mut data = Vec::with_capacity(4 + head.len() + tail.len());
    data.extend_from_slice(&selector);
    data.extend_from_slice(&head);
    data.extend_from_slice(&tail);
    HexBytes(data)
}

/// `approve(spender, amount)` on the stablecoin contract.
pub fn encode_approve(spender: Address, amount: Usdc) -> HexBytes {
    encode_call(
        APPROVE_SELECTOR,
        &[AbiToken::address(spender), AbiToken::uint(amount.0)],
    )
}

/// `mint(to, tokenId, data)` on the horoscope contract. The data payload is
/// the backend's signed authorization, passed through verbatim.
pub fn encode_mint(to: Address, token_id: TokenId, payload: &HexBytes) -> HexBytes {
    encode_call(
        MINT_SELECTOR,
        &[
            AbiToken::address(to),
            AbiToken::Word(token_id.0),
            AbiToken::Bytes(payload.0.clone()),
        ],
    )
}

/// `mintBatch(account, ids, amounts, data)` on the zodiac contract, one
/// unit per reserved piece.
pub fn encode_mint_batch(account: Address, ids: &[TokenId], payload: &HexBytes) -> HexBytes {
    let id_words: Vec<[u8; 32]> = ids.iter().map(|id| id.0).collect();
    let amounts: Vec<[u8; 32]> = ids.iter().map(|_| uint_word(1)).collect();
    encode_call(
        MINT_BATCH_SELECTOR,
        &[
            AbiToken::address(account),
            AbiToken::WordArray(id_words),
            AbiToken::WordArray(amounts),
            AbiToken::Bytes(payload.0.clone()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(fill: u8) -> Address {
        Address([fill; 20])
    }

    #[test]
    fn addresses_parse_and_render_lowercase() {
        let parsed: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        assert_eq!(parsed, addr(0x11));
        assert_eq!(
            "0xAbCdEF0000000000000000000000000000000012"
                .parse::<Address>()
                .unwrap()
                .to_string(),
            "0xabcdef0000000000000000000000000000000012"
        );
        assert!("0x1234".parse::<Address>().is_err());
        assert!("0xzz11111111111111111111111111111111111111"
            .parse::<Address>()
            .is_err());
    }

    #[test]
    fn short_token_ids_left_pad_into_the_word() {
        let id: TokenId = "0x2a".parse().unwrap();
        assert_eq!(id.0[31], 0x2a);
        assert!(id.0[..31].iter().all(|b| *b == 0));
        assert_eq!(
            id.bare_hex(),
            "000000000000000000000000000000000000000000000000000000000000002a"
        );
    }

    #[test]
    fn approve_encodes_to_the_known_vector() {
        let data = encode_approve(addr(0x11), Usdc(1_000_000));
        assert_eq!(
            data.to_string(),
            "0x095ea7b3\
             0000000000000000000000001111111111111111111111111111111111111111\
             00000000000000000000000000000000000000000000000000000000000f4240"
        );
    }

    #[test]
    fn mint_places_payload_behind_an_offset() {
        let token: TokenId = "0x02".parse().unwrap();
        let payload = HexBytes(vec![0xde, 0xad, 0xbe, 0xef]);
        let data = encode_mint(addr(0x22), token, &payload).0;

        assert_eq!(&data[..4], &MINT_SELECTOR);
        // head: to, tokenId, offset to bytes = 0x60
        assert_eq!(data[4 + 32 * 2 + 31], 0x60);
        // tail: length 4, payload right-padded to a word
        assert_eq!(data[4 + 32 * 3 + 31], 4);
        assert_eq!(&data[4 + 32 * 4..4 + 32 * 4 + 4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(data.len(), 4 + 32 * 5);
    }

    #[test]
    fn mint_batch_lays_out_arrays_then_payload() {
        let ids: Vec<TokenId> = vec!["0x01".parse().unwrap(), "0x02".parse().unwrap()];
        let payload = HexBytes(vec![0xff; 33]);
        let data = encode_mint_batch(addr(0x33), &ids, &payload).0;

        assert_eq!(&data[..4], &MINT_BATCH_SELECTOR);
        let word = |i: usize| &data[4 + 32 * i..4 + 32 * (i + 1)];

        // head: account, ids offset (0x80), amounts offset, data offset
        assert_eq!(word(1)[31], 0x80);
        assert_eq!(word(2)[31], 0x80 + 32 * 3);
        assert_eq!(word(3)[31], 0x80 + 32 * 6);
        // ids tail: length then the two ids
        assert_eq!(word(4)[31], 2);
        assert_eq!(word(5)[31], 1);
        assert_eq!(word(6)[31], 2);
        // amounts tail: length then 1 per piece
        assert_eq!(word(7)[31], 2);
        assert_eq!(word(8)[31], 1);
        assert_eq!(word(9)[31], 1);
        // data tail: 33 bytes padded to two words
        assert_eq!(word(10)[31], 33);
        assert_eq!(data.len(), 4 + 32 * 11 + 64);
    }

    #[test]
    fn empty_payload_still_gets_a_length_word() {
        let token: TokenId = "0x01".parse().unwrap();
        let data = encode_mint(addr(0x01), token, &HexBytes::default()).0;
        assert_eq!(data.len(), 4 + 32 * 4);
        assert!(data[4 + 32 * 3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn hex_bytes_round_trip_through_serde() {
        let payload: HexBytes = "0xdeadbeef".parse().unwrap();
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, "\"0xdeadbeef\"");
        assert_eq!(serde_json::from_str::<HexBytes>(&json).unwrap(), payload);
    }
}
