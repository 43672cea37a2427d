use anyhow::{anyhow, bail};
use reqwest;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::chain::{Address, TokenId, TxHash};
use crate::models::art::{ArtMetadata, HoroscopeRecord, ZodiacGallery};
use crate::models::balance::BalanceSnapshot;
use crate::models::collect::{CollectedHoroscope, HoroscopeReservation, ZodiacReservation};
use crate::models::usdc::Usdc;
use crate::models::users::{ConnectedWallet, OnboardUser, User, UserSession};
use crate::models::zodiac::ZodiacSign;
use crate::settings;

/// Client for the external backend API. All persistence lives behind it;
/// this side only ships addresses (lowercased) and reads typed snapshots.
#[derive(Clone)]
pub struct BackendApi {
    url: String,
    blob_url: String,
    metadata_location: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBalance {
    usdc_balance: String,
    allowance_daily_horoscope: String,
    allowance_zodiac: String,
}

impl RawBalance {
    fn into_snapshot(self) -> Result<BalanceSnapshot, anyhow::Error> {
        Ok(BalanceSnapshot {
            usdc_balance: Usdc::parse(&self.usdc_balance)?,
            allowance_daily_horoscope: Usdc::parse(&self.allowance_daily_horoscope)?,
            allowance_zodiac: Usdc::parse(&self.allowance_zodiac)?,
        })
    }
}

/// The backend's error text, whichever key it used this time.
fn error_text(body: &Value) -> Option<String> {
    body.get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl BackendApi {
    pub fn new(settings: &settings::Backend) -> Self {
        Self {
            url: settings.url.trim_end_matches('/').to_string(),
            blob_url: settings.blob_url.trim_end_matches('/').to_string(),
            metadata_location: settings.metadata_location.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Reads the body as JSON, then enforces both the HTTP status and the
    /// `success` flag some endpoints carry, preferring the server's own
    /// error text.
    async fn checked_json(
        response: reqwest::Response,
        context: &str,
    ) -> Result<Value, anyhow::Error> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| anyhow!("{context}: unreadable response: {e}"))?;

        if !status.is_success() {
            bail!(
                "{context}: {}",
                error_text(&body).unwrap_or_else(|| format!("HTTP {status}"))
            );
        }
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            bail!(
                "{context}: {}",
                error_text(&body).unwrap_or_else(|| "request was not successful".to_string())
            );
        }

        Ok(body)
    }

    async fn get(&self, path_and_query: &str, context: &str) -> Result<Value, anyhow::Error> {
        let response = self
            .client
            .get(format!("{}{path_and_query}", self.url))
            .send()
            .await?;
        Self::checked_json(response, context).await
    }

    async fn post(
        &self,
        path: &str,
        payload: Option<&Value>,
        context: &str,
    ) -> Result<Value, anyhow::Error> {
        let mut request = self.client.post(format!("{}{path}", self.url));
        if let Some(payload) = payload {
            request = request.json(payload);
        }
        Self::checked_json(request.send().await?, context).await
    }

    fn field<T: serde::de::DeserializeOwned>(
        body: &Value,
        key: &str,
        context: &str,
    ) -> Result<T, anyhow::Error> {
        let value = body
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("{context}: missing `{key}` in response"))?;
        serde_json::from_value(value).map_err(|e| anyhow!("{context}: bad `{key}`: {e}"))
    }

    pub async fn me(&self) -> Result<UserSession, anyhow::Error> {
        let body = self.get("/api/user/me", "fetch user").await?;
        serde_json::from_value(body).map_err(|e| anyhow!("fetch user: bad response: {e}"))
    }

    pub async fn create_user(&self) -> Result<User, anyhow::Error> {
        let body = self.post("/api/user/create", None, "create user").await?;
        Self::field(&body, "user", "create user")
    }

    pub async fn onboard_user(&self, input: &OnboardUser) -> Result<User, anyhow::Error> {
        let payload = json!({ "name": input.name, "dob": input.dob });
        let body = self
            .post("/api/user/onboard", Some(&payload), "onboard user")
            .await?;
        Self::field(&body, "user", "onboard user")
    }

    pub async fn update_dob(&self, dob: &str) -> Result<User, anyhow::Error> {
        let payload = json!({ "dob": dob });
        let body = self
            .post("/api/user/dob", Some(&payload), "update dob")
            .await?;
        Self::field(&body, "user", "update dob")
    }

    pub async fn connect_wallet(
        &self,
        address: Address,
    ) -> Result<ConnectedWallet, anyhow::Error> {
        let payload = json!({ "walletAddress": address.to_string() });
        let body = self
            .post("/api/user/connected-wallets", Some(&payload), "connect wallet")
            .await?;
        Self::field(&body, "data", "connect wallet")
    }

    pub async fn balance(&self, address: Address) -> Result<BalanceSnapshot, anyhow::Error> {
        let body = self
            .get(
                &format!("/api/user/balance?address={address}"),
                "fetch balance",
            )
            .await?;
        let raw: RawBalance =
            serde_json::from_value(body).map_err(|e| anyhow!("fetch balance: {e}"))?;
        raw.into_snapshot()
    }

    pub async fn request_daily_horoscope(
        &self,
        address: Address,
    ) -> Result<HoroscopeReservation, anyhow::Error> {
        let body = self
            .get(
                &format!("/api/collect/daily_horoscope/request?address={address}"),
                "reserve horoscope",
            )
            .await?;
        serde_json::from_value(body).map_err(|e| anyhow!("reserve horoscope: {e}"))
    }

    pub async fn collect_daily_horoscope(
        &self,
        onchain_id: TokenId,
        minted_address: Address,
        transaction_hash: TxHash,
    ) -> Result<CollectedHoroscope, anyhow::Error> {
        let payload = json!({
            "onchainId": onchain_id.to_string(),
            "mintedAddress": minted_address.to_string(),
            "transactionHash": transaction_hash.to_string(),
        });
        let body = self
            .post("/api/collect/daily_horoscope", Some(&payload), "reveal horoscope")
            .await?;
        serde_json::from_value(body).map_err(|e| anyhow!("reveal horoscope: {e}"))
    }

    /// Reserves zodiac pieces. `amount: None` asks for every remaining
    /// uncollected piece of the sign; the backend resolves the count.
    pub async fn request_zodiac(
        &self,
        sign: ZodiacSign,
        address: Address,
        amount: Option<u64>,
    ) -> Result<ZodiacReservation, anyhow::Error> {
        let mut query = format!(
            "/api/collect/western_zodiac/request?zodiac={}&address={address}",
            sign.api_name()
        );
        if let Some(amount) = amount {
            query.push_str(&format!("&amount={amount}"));
        }
        let body = self.get(&query, "reserve zodiac pieces").await?;
        serde_json::from_value(body).map_err(|e| anyhow!("reserve zodiac pieces: {e}"))
    }

    pub async fn zodiac_gallery(
        &self,
        sign: Option<ZodiacSign>,
    ) -> Result<ZodiacGallery, anyhow::Error> {
        let query = match sign {
            Some(sign) => format!("/api/art/zodiac?zodiac_sign={}", sign.api_name()),
            None => "/api/art/zodiac".to_string(),
        };
        let body = self.get(&query, "fetch zodiac gallery").await?;
        serde_json::from_value(body).map_err(|e| anyhow!("fetch zodiac gallery: {e}"))
    }

    pub async fn horoscopes(&self) -> Result<Vec<HoroscopeRecord>, anyhow::Error> {
        let body = self.get("/api/horoscopes", "fetch horoscopes").await?;
        Self::field(&body, "horoscopes", "fetch horoscopes")
    }

    pub async fn horoscope_day(
        &self,
        date: Option<&str>,
    ) -> Result<Option<HoroscopeRecord>, anyhow::Error> {
        let query = match date {
            Some(date) => format!("/api/horoscopes/day?date={date}"),
            None => "/api/horoscopes/day".to_string(),
        };
        let body = self.get(&query, "fetch horoscope day").await?;
        Self::field(&body, "horoscope", "fetch horoscope day")
    }

    /// Token metadata lives on blob storage, keyed by the bare onchain id.
    pub async fn art_metadata(&self, onchain_id: TokenId) -> Result<ArtMetadata, anyhow::Error> {
        let url = format!(
            "{}/{}/{}.json",
            self.blob_url,
            self.metadata_location,
            onchain_id.bare_hex()
        );
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            bail!("fetch art metadata: HTTP {}", response.status());
        }
        let doc: Value = response.json().await?;
        Ok(ArtMetadata::from_token_json(&doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_strings_parse_into_a_snapshot() {
        let raw: RawBalance = serde_json::from_value(json!({
            "usdcBalance": "2500000",
            "allowanceDailyHoroscope": "1000000",
            "allowanceZodiac": "0",
        }))
        .unwrap();

        let snapshot = raw.into_snapshot().unwrap();
        assert_eq!(snapshot.usdc_balance, Usdc(2_500_000));
        assert_eq!(snapshot.allowance_daily_horoscope, Usdc(1_000_000));
        assert_eq!(snapshot.allowance_zodiac, Usdc::ZERO);
    }

    #[test]
    fn non_numeric_balances_are_rejected() {
        let raw: RawBalance = serde_json::from_value(json!({
            "usdcBalance": "lots",
            "allowanceDailyHoroscope": "0",
            "allowanceZodiac": "0",
        }))
        .unwrap();
        assert!(raw.into_snapshot().is_err());
    }

    #[test]
    fn error_text_prefers_the_error_key() {
        let body = json!({ "error": "nope", "message": "also nope" });
        assert_eq!(error_text(&body).as_deref(), Some("nope"));
        assert_eq!(
            error_text(&json!({ "message": "just this" })).as_deref(),
            Some("just this")
        );
        assert_eq!(error_text(&json!({})), None);
    }
}
