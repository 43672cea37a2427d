use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::TokenId;
use crate::models::zodiac::ZodiacSign;

/// One zodiac art piece in a collection listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZodiacPiece {
    pub id: String,
    pub onchain_id: TokenId,
    pub image_url: String,
    pub artist_id: String,
    pub artist_handle: String,
    pub artist_fid: i64,
    pub western_zodiac_sign: ZodiacSign,
    pub western_zodiac_collection_id: String,
    pub count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The zodiac gallery as one backend read: per-sign counts, per-sign
/// listings, and a flat id lookup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZodiacGallery {
    #[serde(default)]
    pub zodiac_sign_counts: HashMap<ZodiacSign, u32>,
    #[serde(default)]
    pub zodiac_sign_to_piece_listing_map: HashMap<ZodiacSign, Vec<ZodiacPiece>>,
    #[serde(default)]
    pub piece_id_map: HashMap<String, ZodiacPiece>,
}

/// A previously collected daily horoscope record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HoroscopeRecord {
    pub date: String,
    pub id: String,
    pub url: String,
}

/// Token metadata for a revealed art piece, lifted out of the standard
/// `attributes` trait list. Traits we do not model are retained verbatim.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtMetadata {
    pub name: String,
    pub description: String,
    pub image: String,
    pub mini_app: String,
    pub artist_handle: String,
    pub artist_fid: i64,
    pub zodiac_sign: Option<ZodiacSign>,
    pub curation: String,
    pub season: String,
    pub additional_traits: HashMap<String, String>,
}

impl ArtMetadata {
    /// Parses a token metadata document. Unknown attribute values and
    /// non-string traits are ignored rather than failing the whole parse.
    pub fn from_token_json(doc: &Value) -> ArtMetadata {
        let text = |key: &str| {
            doc.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let mut metadata = ArtMetadata {
            name: text("name"),
            description: text("description"),
            image: text("image"),
            ..ArtMetadata::default()
        };

        let attributes = doc
            .get("attributes")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for attribute in attributes {
            let (Some(trait_type), Some(value)) = (
                attribute.get("trait_type").and_then(Value::as_str),
                attribute.get("value").and_then(Value::as_str),
            ) else {
                continue;
            };

            match trait_type {
                "Mini App" => metadata.mini_app = value.to_string(),
                "Artist Handle" => metadata.artist_handle = value.to_string(),
                "Artist FID" => metadata.artist_fid = value.parse().unwrap_or_default(),
                "Zodiac Sign" => metadata.zodiac_sign = value.parse().ok(),
                "Curation" => metadata.curation = value.to_string(),
                "Season" => metadata.season = value.to_string(),
                other => {
                    metadata
                        .additional_traits
                        .insert(other.to_string(), value.to_string());
                }
            }
        }

        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_lifts_known_traits_and_keeps_the_rest() {
        let doc = serde_json::json!({
            "name": "Leo #4",
            "description": "A lion",
            "image": "https://blob.example/leo-4.png",
            "attributes": [
                { "trait_type": "Artist Handle", "value": "@stargazer" },
                { "trait_type": "Artist FID", "value": "8812" },
                { "trait_type": "Zodiac Sign", "value": "Leo" },
                { "trait_type": "Season", "value": "One" },
                { "trait_type": "Palette", "value": "Gold" },
            ],
        });

        let metadata = ArtMetadata::from_token_json(&doc);
        assert_eq!(metadata.name, "Leo #4");
        assert_eq!(metadata.artist_handle, "@stargazer");
        assert_eq!(metadata.artist_fid, 8812);
        assert_eq!(metadata.zodiac_sign, Some(ZodiacSign::Leo));
        assert_eq!(metadata.season, "One");
        assert_eq!(metadata.additional_traits["Palette"], "Gold");
    }

    #[test]
    fn metadata_tolerates_missing_attributes() {
        let metadata = ArtMetadata::from_token_json(&serde_json::json!({ "name": "x" }));
        assert_eq!(metadata.name, "x");
        assert!(metadata.zodiac_sign.is_none());
        assert!(metadata.additional_traits.is_empty());
    }
}
