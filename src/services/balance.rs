use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{RequestHandler, Service, ServiceError};
use crate::chain::Address;
use crate::models::balance::BalanceSnapshot;
use crate::repositories::backend::BackendApi;

pub enum BalanceRequest {
    GetBalance {
        address: String,
        response: oneshot::Sender<Result<BalanceSnapshot, ServiceError>>,
    },
}

/// Reads the wallet's stablecoin balance and the two contract allowances.
/// A failed read yields an error and nothing else; callers must treat an
/// unknown balance as insufficient.
#[derive(Clone)]
pub struct BalanceRequestHandler {
    backend: BackendApi,
}

impl BalanceRequestHandler {
    pub fn new(backend: BackendApi) -> Self {
        Self { backend }
    }

    async fn get_balance(&self, address: &str) -> Result<BalanceSnapshot, ServiceError> {
        if address.trim().is_empty() {
            return Err(ServiceError::Validation("Address is required".to_string()));
        }
        let address: Address = address
            .parse()
            .map_err(|e| ServiceError::Validation(format!("Bad address: {e}")))?;

        self.backend
            .balance(address)
            .await
            .map_err(|e| ServiceError::Repository("Balance".to_string(), e.to_string()))
    }
}

#[async_trait]
impl RequestHandler<BalanceRequest> for BalanceRequestHandler {
    async fn handle_request(&self, request: BalanceRequest) {
        match request {
            BalanceRequest::GetBalance { address, response } => {
                let snapshot = self.get_balance(&address).await;
                let _ = response.send(snapshot);
            }
        }
    }
}

pub struct BalanceService;

impl BalanceService {
    pub fn new() -> Self {
        BalanceService {}
    }
}

#[async_trait]
impl Service<BalanceRequest, BalanceRequestHandler> for BalanceService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings;

    fn handler() -> BalanceRequestHandler {
        BalanceRequestHandler::new(BackendApi::new(&settings::Backend {
            url: "http://127.0.0.1:0".to_string(),
            blob_url: "http://127.0.0.1:0".to_string(),
            metadata_location: "metadata".to_string(),
        }))
    }

    #[tokio::test]
    async fn empty_address_fails_before_any_io() {
        match handler().get_balance("  ").await {
            Err(ServiceError::Validation(message)) => {
                assert_eq!(message, "Address is required");
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_address_fails_before_any_io() {
        match handler().get_balance("0x1234").await {
            Err(ServiceError::Validation(message)) => {
                assert!(message.starts_with("Bad address"));
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
    }
}
