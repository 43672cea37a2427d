use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{RequestHandler, Service, ServiceError};
use crate::chain::TokenId;
use crate::models::art::{ArtMetadata, HoroscopeRecord, ZodiacGallery};
use crate::models::zodiac::ZodiacSign;
use crate::repositories::backend::BackendApi;

pub enum ArtRequest {
    GetZodiacGallery {
        sign: Option<ZodiacSign>,
        response: oneshot::Sender<Result<ZodiacGallery, ServiceError>>,
    },
    GetHoroscopes {
        response: oneshot::Sender<Result<Vec<HoroscopeRecord>, ServiceError>>,
    },
    GetHoroscopeDay {
        date: Option<String>,
        response: oneshot::Sender<Result<Option<HoroscopeRecord>, ServiceError>>,
    },
    GetArtMetadata {
        onchain_id: TokenId,
        response: oneshot::Sender<Result<ArtMetadata, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct ArtRequestHandler {
    backend: BackendApi,
}

impl ArtRequestHandler {
    pub fn new(backend: BackendApi) -> Self {
        Self { backend }
    }

    fn repository_error(e: anyhow::Error) -> ServiceError {
        ServiceError::Repository("Art".to_string(), e.to_string())
    }
}

#[async_trait]
impl RequestHandler<ArtRequest> for ArtRequestHandler {
    async fn handle_request(&self, request: ArtRequest) {
        match request {
            ArtRequest::GetZodiacGallery { sign, response } => {
                let gallery = self
                    .backend
                    .zodiac_gallery(sign)
                    .await
                    .map_err(Self::repository_error);
                let _ = response.send(gallery);
            }
            ArtRequest::GetHoroscopes { response } => {
                let horoscopes = self
                    .backend
                    .horoscopes()
                    .await
                    .map_err(Self::repository_error);
                let _ = response.send(horoscopes);
            }
            ArtRequest::GetHoroscopeDay { date, response } => {
                let horoscope = self
                    .backend
                    .horoscope_day(date.as_deref())
                    .await
                    .map_err(Self::repository_error);
                let _ = response.send(horoscope);
            }
            ArtRequest::GetArtMetadata {
                onchain_id,
                response,
            } => {
                let metadata = self
                    .backend
                    .art_metadata(onchain_id)
                    .await
                    .map_err(Self::repository_error);
                let _ = response.send(metadata);
            }
        }
    }
}

pub struct ArtService;

impl ArtService {
    pub fn new() -> Self {
        ArtService {}
    }
}

#[async_trait]
impl Service<ArtRequest, ArtRequestHandler> for ArtService {}
