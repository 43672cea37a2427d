use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{ChainConfig, RequestHandler, Service, ServiceError};
use crate::chain::{self, Address, TxHash};
use crate::models::collect::{HoroscopeReservation, ZodiacReservation};
use crate::models::usdc::Usdc;
use crate::repositories::wallet::{TxRequest, WalletBridge};

pub enum ChainRequest {
    /// `approve(spender, amount)` on the stablecoin contract. Answers with
    /// the hash as soon as the wallet accepts the submission.
    SubmitApprove {
        owner: Address,
        spender: Address,
        amount: Usdc,
        response: oneshot::Sender<Result<TxHash, ServiceError>>,
    },
    SubmitMintHoroscope {
        to: Address,
        reservation: HoroscopeReservation,
        response: oneshot::Sender<Result<TxHash, ServiceError>>,
    },
    SubmitMintZodiac {
        to: Address,
        reservation: ZodiacReservation,
        response: oneshot::Sender<Result<TxHash, ServiceError>>,
    },
    /// Blocks until the transaction leaves the mempool. `Ok(())` means the
    /// receipt confirmed; a reverted receipt is an error.
    AwaitReceipt {
        tx: TxHash,
        response: oneshot::Sender<Result<(), ServiceError>>,
    },
}

#[derive(Clone)]
pub struct ChainRequestHandler {
    bridge: Arc<WalletBridge>,
    config: ChainConfig,
    poll_interval: Duration,
}

impl ChainRequestHandler {
    pub async fn connect(
        bridge_url: &str,
        config: ChainConfig,
        confirm_poll_secs: u64,
    ) -> Result<Self, anyhow::Error> {
        let bridge = WalletBridge::connect(bridge_url).await?;

        Ok(Self {
            bridge: Arc::new(bridge),
            config,
            poll_interval: Duration::from_secs(confirm_poll_secs),
        })
    }

    /// The wallet may sit on any chain when a flow starts, and can drift
    /// mid-flow; every submission re-checks and switches first.
    async fn ensure_chain(&self) -> Result<(), ServiceError> {
        let current = self
            .bridge
            .chain_id()
            .await
            .map_err(|e| ServiceError::Wallet(e.to_string()))?;

        if current != self.config.chain_id {
            log::info!(
                "Wallet is on chain {}, switching to {}.",
                current,
                self.config.chain_id
            );
            self.bridge
                .switch_chain(self.config.chain_id)
                .await
                .map_err(|e| ServiceError::Wallet(e.to_string()))?;
        }

        Ok(())
    }

    async fn submit(&self, from: Address, to: Address, data: chain::HexBytes) -> Result<TxHash, ServiceError> {
        self.ensure_chain().await?;

        let tx = self
            .bridge
            .send_transaction(&TxRequest { from, to, data })
            .await
            .map_err(|e| ServiceError::Wallet(e.to_string()))?;

        log::info!("Submitted transaction {} to {}.", tx, to);
        Ok(tx)
    }

    async fn submit_approve(
        &self,
        owner: Address,
        spender: Address,
        amount: Usdc,
    ) -> Result<TxHash, ServiceError> {
        let data = chain::encode_approve(spender, amount);
        self.submit(owner, self.config.usdc, data).await
    }

    async fn submit_mint_horoscope(
        &self,
        to: Address,
        reservation: &HoroscopeReservation,
    ) -> Result<TxHash, ServiceError> {
        let data = chain::encode_mint(to, reservation.onchain_id, &reservation.data_payload);
        self.submit(to, self.config.daily_horoscope, data).await
    }

    async fn submit_mint_zodiac(
        &self,
        to: Address,
        reservation: &ZodiacReservation,
    ) -> Result<TxHash, ServiceError> {
        let data = chain::encode_mint_batch(to, &reservation.pieces, &reservation.data_payload);
        self.submit(to, self.config.zodiac, data).await
    }

    async fn await_receipt(&self, tx: TxHash) -> Result<(), ServiceError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;

            match self.bridge.transaction_receipt(tx).await {
                Ok(None) => continue,
                Ok(Some(true)) => {
                    log::info!("Transaction {} confirmed.", tx);
                    return Ok(());
                }
                Ok(Some(false)) => {
                    return Err(ServiceError::Wallet(format!("Transaction {tx} reverted")));
                }
                Err(e) => return Err(ServiceError::Wallet(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl RequestHandler<ChainRequest> for ChainRequestHandler {
    async fn handle_request(&self, request: ChainRequest) {
        match request {
            ChainRequest::SubmitApprove {
                owner,
                spender,
                amount,
                response,
            } => {
                let result = self.submit_approve(owner, spender, amount).await;
                let _ = response.send(result);
            }
            ChainRequest::SubmitMintHoroscope {
                to,
                reservation,
                response,
            } => {
                let result = self.submit_mint_horoscope(to, &reservation).await;
                let _ = response.send(result);
            }
            ChainRequest::SubmitMintZodiac {
                to,
                reservation,
                response,
            } => {
                let result = self.submit_mint_zodiac(to, &reservation).await;
                let _ = response.send(result);
            }
            ChainRequest::AwaitReceipt { tx, response } => {
                let result = self.await_receipt(tx).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct ChainService;

impl ChainService {
    pub fn new() -> Self {
        ChainService {}
    }
}

#[async_trait]
impl Service<ChainRequest, ChainRequestHandler> for ChainService {}
