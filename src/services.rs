use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::chain::Address;
use crate::repositories::backend::BackendApi;
use crate::settings::Settings;

pub mod art;
pub mod balance;
pub mod chain;
pub mod collect;
pub mod http;
pub mod users;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// Rejected before any I/O happened.
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Repository error: {0} - {1}")]
    Repository(String, String),
    #[error("Communication error: {0} - {1}")]
    Communication(String, String),
    #[error("External service error: {0} -> {1} => {2}")]
    ExternalService(String, String, String),
    #[error("Wallet error: {0}")]
    Wallet(String),
    /// The mint confirmed on-chain but the reveal call failed. The user has
    /// paid; the transaction hash allows an idempotent replay.
    #[error("Minted but not revealed (tx {tx_hash}): {message}")]
    Unrevealed { tx_hash: String, message: String },
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

/// Contract addresses and the target chain, parsed once at startup.
#[derive(Clone, Copy, Debug)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub usdc: Address,
    pub daily_horoscope: Address,
    pub zodiac: Address,
}

impl ChainConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, anyhow::Error> {
        Ok(Self {
            chain_id: settings.chain.id,
            usdc: settings.contracts.usdc.parse()?,
            daily_horoscope: settings.contracts.daily_horoscope.parse()?,
            zodiac: settings.contracts.zodiac.parse()?,
        })
    }
}

pub async fn start_services(settings: Settings, listen: String) -> Result<(), anyhow::Error> {
    let chain_config = ChainConfig::from_settings(&settings)?;
    let costs = collect::CostTable::from_settings(&settings.costs);
    let backend = BackendApi::new(&settings.backend);

    let (art_tx, mut art_rx) = mpsc::channel(512);
    let (balance_tx, mut balance_rx) = mpsc::channel(512);
    let (chain_tx, mut chain_rx) = mpsc::channel(512);
    let (collect_tx, mut collect_rx) = mpsc::channel(512);
    let (user_tx, mut user_rx) = mpsc::channel(512);

    let mut art_service = art::ArtService::new();
    let mut balance_service = balance::BalanceService::new();
    let mut chain_service = chain::ChainService::new();
    let mut collect_service = collect::CollectService::new();
    let mut user_service = users::UserService::new();

    println!("[*] Starting user service.");
    let user_backend = backend.clone();
    tokio::spawn(async move {
        user_service
            .run(users::UserRequestHandler::new(user_backend), &mut user_rx)
            .await;
    });

    println!("[*] Starting balance service.");
    let balance_backend = backend.clone();
    tokio::spawn(async move {
        balance_service
            .run(
                balance::BalanceRequestHandler::new(balance_backend),
                &mut balance_rx,
            )
            .await;
    });

    println!("[*] Starting chain service.");
    let bridge_url = settings.wallet.url.clone();
    let confirm_poll_secs = settings.chain.confirm_poll_secs;
    tokio::spawn(async move {
        let handler =
            chain::ChainRequestHandler::connect(&bridge_url, chain_config, confirm_poll_secs)
                .await
                .expect("Could not connect to the wallet bridge.");

        chain_service.run(handler, &mut chain_rx).await;
    });

    println!("[*] Starting collect service.");
    let collect_backend = backend.clone();
    let collect_balance_tx = balance_tx.clone();
    let collect_chain_tx = chain_tx.clone();
    let collect_user_tx = user_tx.clone();
    let collect_self_tx = collect_tx.clone();
    tokio::spawn(async move {
        let handler = collect::CollectRequestHandler::new(
            collect_backend,
            costs,
            chain_config,
            collect_balance_tx,
            collect_chain_tx,
            collect_user_tx,
            collect_self_tx,
        );

        collect_service.run(handler, &mut collect_rx).await;
    });

    println!("[*] Starting art service.");
    let art_backend = backend.clone();
    tokio::spawn(async move {
        art_service
            .run(art::ArtRequestHandler::new(art_backend), &mut art_rx)
            .await;
    });

    println!("[*] Starting HTTP server.");
    http::start_http_server(listen, collect_tx, user_tx, balance_tx, art_tx).await
}
