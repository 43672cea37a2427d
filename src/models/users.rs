use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::zodiac::ZodiacSign;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountLoginType {
    Email,
    Farcaster,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedWallet {
    pub id: String,
    pub user_id: String,
    pub wallet_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A user as the backend reports it. Everything here is externally
/// persisted; this crate only holds request-scoped copies.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub account_login_type: AccountLoginType,
    pub name: Option<String>,
    /// ISO date or datetime string, withheld by the backend when private.
    pub dob: Option<String>,
    pub is_dob_public: bool,
    pub is_onboarded: bool,
    pub farcaster_account_id: Option<String>,
    pub privy_account_id: Option<String>,
    #[serde(default)]
    pub connected_wallets: Vec<ConnectedWallet>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// The dob arrives either as a bare date or a full RFC 3339 timestamp.
    pub fn dob_date(&self) -> Option<NaiveDate> {
        let raw = self.dob.as_deref()?;
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
    }

    pub fn zodiac_sign(&self) -> Option<ZodiacSign> {
        use chrono::Datelike;
        let dob = self.dob_date()?;
        ZodiacSign::for_date(dob.month(), dob.day())
    }
}

/// `GET /api/user/me` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    pub is_authenticated: bool,
    pub user: Option<User>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnboardUser {
    pub name: String,
    pub dob: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_dob(dob: Option<&str>) -> User {
        serde_json::from_value(serde_json::json!({
            "id": "u-1",
            "accountLoginType": "FARCASTER",
            "name": "Lyra",
            "dob": dob,
            "isDobPublic": false,
            "isOnboarded": true,
            "farcasterAccountId": "12345",
            "privyAccountId": null,
            "connectedWallets": [],
            "createdAt": "2025-01-05T12:00:00Z",
            "updatedAt": "2025-01-05T12:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn dob_parses_both_wire_shapes() {
        assert_eq!(
            user_with_dob(Some("1990-12-25")).zodiac_sign(),
            Some(ZodiacSign::Capricorn)
        );
        assert_eq!(
            user_with_dob(Some("1990-06-21T00:00:00.000Z")).zodiac_sign(),
            Some(ZodiacSign::Cancer)
        );
        assert_eq!(user_with_dob(None).zodiac_sign(), None);
    }

    #[test]
    fn session_deserializes_without_user() {
        let session: UserSession =
            serde_json::from_str(r#"{"isAuthenticated":false,"user":null}"#).unwrap();
        assert!(!session.is_authenticated);
        assert!(session.user.is_none());
    }
}
