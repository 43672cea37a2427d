use serde::{Deserialize, Serialize};

use crate::chain::{HexBytes, TokenId};

/// A server-issued reservation for one daily horoscope slot: the token id
/// to mint plus the signed authorization payload passed verbatim into the
/// mint call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoroscopeReservation {
    pub onchain_id: TokenId,
    pub data_payload: HexBytes,
}

/// A reservation of zodiac art pieces. The backend picks the concrete
/// piece ids; when the caller asked for "all", this is every remaining
/// uncollected piece for the sign.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZodiacReservation {
    pub pieces: Vec<TokenId>,
    pub data_payload: HexBytes,
}

impl ZodiacReservation {
    pub fn piece_count(&self) -> u64 {
        self.pieces.len() as u64
    }
}

/// The revealed daily horoscope, returned by the finalizer after the mint
/// confirmed. Immutable from this side once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectedHoroscope {
    pub date: String,
    pub id: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horoscope_reservation_parses_the_wire_shape() {
        let reservation: HoroscopeReservation = serde_json::from_str(
            r#"{"onchainId":"0x01f3","dataPayload":"0xdeadbeef"}"#,
        )
        .unwrap();
        assert_eq!(reservation.onchain_id, "0x01f3".parse().unwrap());
        assert_eq!(reservation.data_payload.0, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn zodiac_reservation_counts_pieces() {
        let reservation: ZodiacReservation = serde_json::from_str(
            r#"{"pieces":["0x01","0x02","0x03"],"dataPayload":"0x"}"#,
        )
        .unwrap();
        assert_eq!(reservation.piece_count(), 3);
        assert!(reservation.data_payload.0.is_empty());
    }
}
