use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The twelve western zodiac signs, serialized with the backend's lowercase
/// wire names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZodiacSign {
    Aries,
    Taurus,
    Gemini,
    Cancer,
    Leo,
    Virgo,
    Libra,
    Scorpio,
    Sagittarius,
    Capricorn,
    Aquarius,
    Pisces,
}

/// Inclusive (month, day) range of a sign.
struct SignDates {
    start: (u32, u32),
    end: (u32, u32),
}

impl ZodiacSign {
    pub const ALL: [ZodiacSign; 12] = [
        ZodiacSign::Aries,
        ZodiacSign::Taurus,
        ZodiacSign::Gemini,
        ZodiacSign::Cancer,
        ZodiacSign::Leo,
        ZodiacSign::Virgo,
        ZodiacSign::Libra,
        ZodiacSign::Scorpio,
        ZodiacSign::Sagittarius,
        ZodiacSign::Capricorn,
        ZodiacSign::Aquarius,
        ZodiacSign::Pisces,
    ];

    pub fn api_name(self) -> &'static str {
        match self {
            ZodiacSign::Aries => "aries",
            ZodiacSign::Taurus => "taurus",
            ZodiacSign::Gemini => "gemini",
            ZodiacSign::Cancer => "cancer",
            ZodiacSign::Leo => "leo",
            ZodiacSign::Virgo => "virgo",
            ZodiacSign::Libra => "libra",
            ZodiacSign::Scorpio => "scorpio",
            ZodiacSign::Sagittarius => "sagittarius",
            ZodiacSign::Capricorn => "capricorn",
            ZodiacSign::Aquarius => "aquarius",
            ZodiacSign::Pisces => "pisces",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            ZodiacSign::Aries => "Aries",
            ZodiacSign::Taurus => "Taurus",
            ZodiacSign::Gemini => "Gemini",
            ZodiacSign::Cancer => "Cancer",
            ZodiacSign::Leo => "Leo",
            ZodiacSign::Virgo => "Virgo",
            ZodiacSign::Libra => "Libra",
            ZodiacSign::Scorpio => "Scorpio",
            ZodiacSign::Sagittarius => "Sagittarius",
            ZodiacSign::Capricorn => "Capricorn",
            ZodiacSign::Aquarius => "Aquarius",
            ZodiacSign::Pisces => "Pisces",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ZodiacSign::Aries => "♈︎",
            ZodiacSign::Taurus => "♉︎",
            ZodiacSign::Gemini => "♊︎",
            ZodiacSign::Cancer => "♋︎",
            ZodiacSign::Leo => "♌︎",
            ZodiacSign::Virgo => "♍︎",
            ZodiacSign::Libra => "♎︎",
            ZodiacSign::Scorpio => "♏︎",
            ZodiacSign::Sagittarius => "♐︎",
            ZodiacSign::Capricorn => "♑︎",
            ZodiacSign::Aquarius => "♒︎",
            ZodiacSign::Pisces => "♓︎",
        }
    }

    /// Astrological house, 1 (Aries) through 12 (Pisces).
    pub fn house(self) -> u8 {
        self as u8 + 1
    }

    pub fn element(self) -> &'static str {
        match self {
            ZodiacSign::Aries | ZodiacSign::Leo | ZodiacSign::Sagittarius => "Fire",
            ZodiacSign::Taurus | ZodiacSign::Virgo | ZodiacSign::Capricorn => "Earth",
            ZodiacSign::Gemini | ZodiacSign::Libra | ZodiacSign::Aquarius => "Air",
            ZodiacSign::Cancer | ZodiacSign::Scorpio | ZodiacSign::Pisces => "Water",
        }
    }

    fn dates(self) -> SignDates {
        let (start, end) = match self {
            ZodiacSign::Aries => ((3, 21), (4, 19)),
            ZodiacSign::Taurus => ((4, 20), (5, 20)),
            ZodiacSign::Gemini => ((5, 21), (6, 20)),
            ZodiacSign::Cancer => ((6, 21), (7, 22)),
            ZodiacSign::Leo => ((7, 23), (8, 22)),
            ZodiacSign::Virgo => ((8, 23), (9, 22)),
            ZodiacSign::Libra => ((9, 23), (10, 22)),
            ZodiacSign::Scorpio => ((10, 23), (11, 21)),
            ZodiacSign::Sagittarius => ((11, 22), (12, 21)),
            ZodiacSign::Capricorn => ((12, 22), (1, 19)),
            ZodiacSign::Aquarius => ((1, 20), (2, 18)),
            ZodiacSign::Pisces => ((2, 19), (3, 20)),
        };
        SignDates { start, end }
    }

    /// Resolves the sign covering a calendar (month, day). Capricorn spans
    /// the year boundary and is matched against December and January
    /// separately; every other sign matches within its start or end month.
    pub fn for_date(month: u32, day: u32) -> Option<ZodiacSign> {
        ZodiacSign::ALL.into_iter().find(|sign| {
            let SignDates { start, end } = sign.dates();
            if *sign == ZodiacSign::Capricorn {
                (month == 12 && day >= start.1) || (month == 1 && day <= end.1)
            } else {
                (month == start.0 && day >= start.1) || (month == end.0 && day <= end.1)
            }
        })
    }
}

impl fmt::Display for ZodiacSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

impl FromStr for ZodiacSign {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        ZodiacSign::ALL
            .into_iter()
            .find(|sign| sign.api_name() == raw.to_lowercase())
            .ok_or_else(|| format!("unknown zodiac sign: {raw}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capricorn_spans_the_year_boundary() {
        assert_eq!(ZodiacSign::for_date(12, 25), Some(ZodiacSign::Capricorn));
        assert_eq!(ZodiacSign::for_date(1, 1), Some(ZodiacSign::Capricorn));
        assert_eq!(ZodiacSign::for_date(12, 22), Some(ZodiacSign::Capricorn));
        assert_eq!(ZodiacSign::for_date(1, 19), Some(ZodiacSign::Capricorn));
    }

    #[test]
    fn boundary_start_dates_belong_to_the_incoming_sign() {
        assert_eq!(ZodiacSign::for_date(6, 21), Some(ZodiacSign::Cancer));
        assert_eq!(ZodiacSign::for_date(6, 20), Some(ZodiacSign::Gemini));
        assert_eq!(ZodiacSign::for_date(3, 21), Some(ZodiacSign::Aries));
        assert_eq!(ZodiacSign::for_date(1, 20), Some(ZodiacSign::Aquarius));
    }

    #[test]
    fn every_day_of_the_year_resolves() {
        let days_in_month = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
        for (month0, days) in days_in_month.iter().enumerate() {
            for day in 1..=*days {
                let month = month0 as u32 + 1;
                assert!(
                    ZodiacSign::for_date(month, day).is_some(),
                    "no sign for {month}-{day}"
                );
            }
        }
    }

    #[test]
    fn wire_names_round_trip() {
        for sign in ZodiacSign::ALL {
            assert_eq!(sign.api_name().parse::<ZodiacSign>().unwrap(), sign);
            let json = serde_json::to_string(&sign).unwrap();
            assert_eq!(json, format!("\"{}\"", sign.api_name()));
            assert_eq!(serde_json::from_str::<ZodiacSign>(&json).unwrap(), sign);
        }
    }

    #[test]
    fn houses_follow_declaration_order() {
        assert_eq!(ZodiacSign::Aries.house(), 1);
        assert_eq!(ZodiacSign::Capricorn.house(), 10);
        assert_eq!(ZodiacSign::Pisces.house(), 12);
    }

    #[test]
    fn display_metadata_is_wired_per_sign() {
        assert_eq!(ZodiacSign::Leo.title(), "Leo");
        assert_eq!(ZodiacSign::Leo.element(), "Fire");
        assert_eq!(ZodiacSign::Scorpio.element(), "Water");
        assert_eq!(ZodiacSign::Aquarius.symbol(), "♒︎");
        assert_eq!(ZodiacSign::Virgo.to_string(), "Virgo");
    }
}
