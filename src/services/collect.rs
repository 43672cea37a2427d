use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::balance::BalanceRequest;
use super::chain::ChainRequest;
use super::users::UserRequest;
use super::{ChainConfig, RequestHandler, Service, ServiceError};
use crate::chain::{Address, TokenId, TxHash};
use crate::models::balance::{BalanceSnapshot, PurchaseKind};
use crate::models::collect::{CollectedHoroscope, HoroscopeReservation, ZodiacReservation};
use crate::models::usdc::Usdc;
use crate::models::zodiac::ZodiacSign;
use crate::repositories::backend::BackendApi;
use crate::settings;

pub type FlowId = Uuid;

/// Unit costs per purchase contract.
#[derive(Clone, Copy, Debug)]
pub struct CostTable {
    pub daily_horoscope: Usdc,
    pub zodiac_piece: Usdc,
}

impl CostTable {
    pub fn from_settings(costs: &settings::Costs) -> Self {
        Self {
            daily_horoscope: Usdc::from_cents(costs.daily_horoscope_cents),
            zodiac_piece: Usdc::from_cents(costs.zodiac_piece_cents),
        }
    }
}

/// How many pieces a zodiac flow buys. `All` is resolved by the backend
/// into every remaining uncollected piece for the sign.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quantity {
    All,
    Count(u64),
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Count(u64),
            Word(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Count(0) => Err(serde::de::Error::custom("quantity must be at least 1")),
            Wire::Count(n) => Ok(Quantity::Count(n)),
            Wire::Word(word) if word == "all" => Ok(Quantity::All),
            Wire::Word(word) => Err(serde::de::Error::custom(format!("bad quantity: {word}"))),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum FlowKind {
    DailyHoroscope,
    Zodiac {
        sign: ZodiacSign,
        total_pieces: u64,
        collected_pieces: u64,
    },
}

impl FlowKind {
    fn purchase_kind(&self) -> PurchaseKind {
        match self {
            FlowKind::DailyHoroscope => PurchaseKind::DailyHoroscope,
            FlowKind::Zodiac { .. } => PurchaseKind::Zodiac,
        }
    }

    /// How many pieces an "all" selection buys: the remaining uncollected
    /// pieces, or the full set once everything has been collected before.
    fn all_count(&self) -> u64 {
        match self {
            FlowKind::DailyHoroscope => 1,
            FlowKind::Zodiac {
                total_pieces,
                collected_pieces,
                ..
            } => {
                if collected_pieces >= total_pieces {
                    *total_pieces
                } else {
                    total_pieces - collected_pieces
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum Reservation {
    Horoscope(HoroscopeReservation),
    Zodiac(ZodiacReservation),
}

impl Reservation {
    fn piece_count(&self) -> u64 {
        match self {
            Reservation::Horoscope(_) => 1,
            Reservation::Zodiac(reservation) => reservation.piece_count(),
        }
    }
}

/// Which step a parked error retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStep {
    Reservation,
    Balance,
    Approve,
    Collect,
    Reveal { tx: TxHash },
}

/// The workflow state of one purchase instance. Exactly one of these is
/// authoritative per flow; there are no independent boolean flags.
#[derive(Clone, Debug)]
pub enum FlowState {
    /// Zodiac flows start here with the quantity picker.
    Idle,
    RequestingReservation,
    /// Reservation in hand, balance unknown or insufficient.
    AwaitingBalance,
    NeedsApproval,
    ReadyToCollect,
    Approving { tx: Option<TxHash> },
    Approved,
    Collecting,
    /// Mint submitted; `minted` flips once the receipt confirms and the
    /// reveal call is still outstanding.
    Confirming { tx: TxHash, minted: bool },
    Success { artifact: Option<CollectedHoroscope> },
    Error { message: String, retry: RetryStep },
}

impl FlowState {
    fn name(&self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::RequestingReservation => "requesting_reservation",
            FlowState::AwaitingBalance => "awaiting_balance",
            FlowState::NeedsApproval => "needs_approval",
            FlowState::ReadyToCollect => "ready_to_collect",
            FlowState::Approving { .. } => "approving",
            FlowState::Approved => "approved",
            FlowState::Collecting => "collecting",
            FlowState::Confirming { .. } => "confirming",
            FlowState::Success { .. } => "success",
            FlowState::Error { .. } => "error",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Success { .. })
    }
}

/// Completions of the asynchronous steps, reported back into the flow.
#[derive(Debug)]
pub enum FlowEvent {
    ReservationReady(Reservation),
    ReservationFailed(String),
    BalanceReady(BalanceSnapshot),
    BalanceFailed(String),
    ApproveSubmitted(TxHash),
    ApproveFailed(String),
    ApproveConfirmed,
    MintSubmitted(TxHash),
    MintFailed(String),
    MintConfirmed,
    RevealReady(CollectedHoroscope),
    RevealFailed { tx: TxHash, message: String },
}

/// User-initiated actions against an open flow.
#[derive(Clone, Copy, Debug)]
pub enum FlowAction {
    SelectQuantity(Quantity),
    Approve,
    Collect,
    Retry,
}

/// Side effects a transition asks for. Executed outside the flow lock;
/// every completion comes back as a `FlowEvent` stamped with the flow's
/// generation at dispatch time.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    RequestReservation,
    FetchBalance,
    SubmitApprove,
    AwaitApproval(TxHash),
    SubmitMint,
    AwaitMint(TxHash),
    Reveal(TxHash),
    ConnectWallet,
}

/// The panel a UI shell renders for a flow, verbatim.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Panel {
    Loading,
    SelectQuantity {
        sign: ZodiacSign,
        unit_cost: String,
        projected_cost: String,
        max: u64,
        all_count: u64,
    },
    InsufficientBalance {
        address: String,
    },
    ApproveTransfer {
        cost: String,
        busy: bool,
    },
    ReadyToCollect {
        cost: String,
        busy: bool,
    },
    Collecting,
    Success {
        image_url: Option<String>,
        pieces: Vec<TokenId>,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct FlowSnapshot {
    pub id: FlowId,
    pub state: &'static str,
    pub panel: Panel,
    pub error: Option<String>,
}

pub struct Flow {
    id: FlowId,
    /// Bumped whenever in-flight work is invalidated (quantity change);
    /// completions stamped with an older generation are discarded.
    generation: u64,
    address: Address,
    kind: FlowKind,
    quantity: Quantity,
    reservation: Option<Reservation>,
    balance: Option<BalanceSnapshot>,
    approved: bool,
    state: FlowState,
}

impl Flow {
    fn open_horoscope(address: Address) -> (Flow, Vec<Command>) {
        let flow = Flow {
            id: Uuid::new_v4(),
            generation: 0,
            address,
            kind: FlowKind::DailyHoroscope,
            quantity: Quantity::Count(1),
            reservation: None,
            balance: None,
            approved: false,
            state: FlowState::RequestingReservation,
        };
        (flow, vec![Command::RequestReservation, Command::FetchBalance])
    }

    fn open_zodiac(
        address: Address,
        sign: ZodiacSign,
        total_pieces: u64,
        collected_pieces: u64,
    ) -> (Flow, Vec<Command>) {
        let flow = Flow {
            id: Uuid::new_v4(),
            generation: 0,
            address,
            kind: FlowKind::Zodiac {
                sign,
                total_pieces,
                collected_pieces,
            },
            quantity: Quantity::All,
            reservation: None,
            balance: None,
            approved: false,
            state: FlowState::Idle,
        };
        (flow, vec![Command::FetchBalance])
    }

    /// The amount this flow spends: the reserved piece count once a
    /// reservation exists, the selected quantity before that.
    fn cost(&self, costs: &CostTable) -> Usdc {
        let unit = match self.kind {
            FlowKind::DailyHoroscope => costs.daily_horoscope,
            FlowKind::Zodiac { .. } => costs.zodiac_piece,
        };
        let count = match &self.reservation {
            Some(reservation) => reservation.piece_count(),
            None => match self.quantity {
                Quantity::All => self.kind.all_count(),
                Quantity::Count(n) => n,
            },
        };
        unit.checked_mul(count).unwrap_or(Usdc(u128::MAX))
    }

    /// The two purchase gates, evaluated whenever cost or funds change.
    /// Unknown balance fails closed; approval already confirmed in this
    /// flow short-circuits the allowance gate.
    fn apply_gates(&mut self, costs: &CostTable) {
        let cost = self.cost(costs);

        let Some(balance) = self.balance else {
            self.state = FlowState::AwaitingBalance;
            return;
        };
        if !balance.covers_balance(cost) {
            self.state = FlowState::AwaitingBalance;
            return;
        }

        if self.approved {
            self.state = FlowState::Approved;
        } else if balance.covers_allowance(self.kind.purchase_kind(), cost) {
            self.state = FlowState::ReadyToCollect;
        } else {
            self.state = FlowState::NeedsApproval;
        }
    }

    fn fail(&mut self, message: String, retry: RetryStep) {
        if !self.state.is_terminal() {
            self.state = FlowState::Error { message, retry };
        }
    }

    /// The authoritative transition function for asynchronous completions.
    fn on_event(&mut self, event: FlowEvent, costs: &CostTable) -> Vec<Command> {
        match event {
            FlowEvent::ReservationReady(reservation) => {
                if matches!(self.state, FlowState::RequestingReservation) {
                    self.reservation = Some(reservation);
                    self.apply_gates(costs);
                }
                Vec::new()
            }
            FlowEvent::ReservationFailed(message) => {
                self.fail(message, RetryStep::Reservation);
                Vec::new()
            }
            FlowEvent::BalanceReady(snapshot) => {
                self.balance = Some(snapshot);
                if matches!(self.state, FlowState::AwaitingBalance) {
                    self.apply_gates(costs);
                }
                Vec::new()
            }
            FlowEvent::BalanceFailed(message) => {
                // A refresh failure after approval is not fatal; the stale
                // snapshot stays and the flow keeps its state.
                if matches!(
                    self.state,
                    FlowState::Idle
                        | FlowState::RequestingReservation
                        | FlowState::AwaitingBalance
                ) {
                    self.fail(message, RetryStep::Balance);
                }
                Vec::new()
            }
            FlowEvent::ApproveSubmitted(tx) => {
                if matches!(self.state, FlowState::Approving { tx: None }) {
                    self.state = FlowState::Approving { tx: Some(tx) };
                    return vec![Command::ConnectWallet, Command::AwaitApproval(tx)];
                }
                Vec::new()
            }
            FlowEvent::ApproveFailed(message) => {
                if matches!(self.state, FlowState::Approving { .. }) {
                    self.fail(message, RetryStep::Approve);
                }
                Vec::new()
            }
            FlowEvent::ApproveConfirmed => {
                if matches!(self.state, FlowState::Approving { tx: Some(_) }) {
                    self.approved = true;
                    self.state = FlowState::Approved;
                    return vec![Command::FetchBalance];
                }
                Vec::new()
            }
            FlowEvent::MintSubmitted(tx) => {
                if matches!(self.state, FlowState::Collecting) {
                    self.state = FlowState::Confirming { tx, minted: false };
                    return vec![Command::ConnectWallet, Command::AwaitMint(tx)];
                }
                Vec::new()
            }
            FlowEvent::MintFailed(message) => {
                if matches!(
                    self.state,
                    FlowState::Collecting | FlowState::Confirming { minted: false, .. }
                ) {
                    self.fail(message, RetryStep::Collect);
                }
                Vec::new()
            }
            FlowEvent::MintConfirmed => match self.state {
                FlowState::Confirming { tx, minted: false } => match self.kind {
                    FlowKind::DailyHoroscope => {
                        self.state = FlowState::Confirming { tx, minted: true };
                        vec![Command::Reveal(tx)]
                    }
                    FlowKind::Zodiac { .. } => {
                        self.state = FlowState::Success { artifact: None };
                        Vec::new()
                    }
                },
                // A confirmation without a known hash must never reach the
                // finalizer.
                FlowState::Collecting => {
                    self.fail(
                        "Transaction hash unavailable".to_string(),
                        RetryStep::Collect,
                    );
                    Vec::new()
                }
                _ => Vec::new(),
            },
            FlowEvent::RevealReady(artifact) => {
                if matches!(self.state, FlowState::Confirming { minted: true, .. }) {
                    self.state = FlowState::Success {
                        artifact: Some(artifact),
                    };
                }
                Vec::new()
            }
            FlowEvent::RevealFailed { tx, message } => {
                if matches!(self.state, FlowState::Confirming { minted: true, .. }) {
                    self.fail(message, RetryStep::Reveal { tx });
                }
                Vec::new()
            }
        }
    }

    /// The authoritative transition function for user actions. Actions not
    /// offered by the current state are rejected before any I/O.
    fn on_action(
        &mut self,
        action: FlowAction,
        _costs: &CostTable,
    ) -> Result<Vec<Command>, ServiceError> {
        match action {
            FlowAction::SelectQuantity(quantity) => {
                if !matches!(self.kind, FlowKind::Zodiac { .. }) {
                    return Err(ServiceError::Validation(
                        "Quantity applies to zodiac flows only".to_string(),
                    ));
                }
                if !matches!(
                    self.state,
                    FlowState::Idle
                        | FlowState::AwaitingBalance
                        | FlowState::NeedsApproval
                        | FlowState::ReadyToCollect
                ) {
                    return Err(ServiceError::Validation(
                        "Quantity cannot change at this step".to_string(),
                    ));
                }

                // A changed quantity voids the reservation; anything still
                // in flight for the old one must not land.
                self.quantity = quantity;
                self.reservation = None;
                self.generation += 1;
                self.state = FlowState::RequestingReservation;
                Ok(vec![Command::RequestReservation])
            }
            FlowAction::Approve => {
                if !matches!(self.state, FlowState::NeedsApproval) {
                    return Err(ServiceError::Validation(
                        "Approval is not available in this state".to_string(),
                    ));
                }
                self.state = FlowState::Approving { tx: None };
                Ok(vec![Command::SubmitApprove])
            }
            FlowAction::Collect => {
                if !matches!(self.state, FlowState::ReadyToCollect | FlowState::Approved) {
                    return Err(ServiceError::Validation(
                        "Collection is not available in this state".to_string(),
                    ));
                }
                if self.reservation.is_none() {
                    return Err(ServiceError::Validation(
                        "No reservation to collect".to_string(),
                    ));
                }
                self.state = FlowState::Collecting;
                Ok(vec![Command::SubmitMint])
            }
            FlowAction::Retry => {
                let FlowState::Error { retry, .. } = self.state else {
                    return Err(ServiceError::Validation(
                        "Nothing to retry".to_string(),
                    ));
                };
                match retry {
                    RetryStep::Reservation => {
                        self.state = FlowState::RequestingReservation;
                        Ok(vec![Command::RequestReservation])
                    }
                    RetryStep::Balance => {
                        self.state = FlowState::AwaitingBalance;
                        Ok(vec![Command::FetchBalance])
                    }
                    RetryStep::Approve => {
                        self.state = FlowState::Approving { tx: None };
                        Ok(vec![Command::SubmitApprove])
                    }
                    RetryStep::Collect => {
                        self.state = FlowState::Collecting;
                        Ok(vec![Command::SubmitMint])
                    }
                    RetryStep::Reveal { tx } => {
                        self.state = FlowState::Confirming { tx, minted: true };
                        Ok(vec![Command::Reveal(tx)])
                    }
                }
            }
        }
    }

    fn panel(&self, costs: &CostTable) -> Panel {
        let cost = self.cost(costs).to_dollars();

        match &self.state {
            FlowState::Idle => self.quantity_panel(costs),
            FlowState::RequestingReservation => Panel::Loading,
            FlowState::AwaitingBalance => match self.balance {
                None => Panel::Loading,
                Some(_) => Panel::InsufficientBalance {
                    address: self.address.to_string(),
                },
            },
            FlowState::NeedsApproval => Panel::ApproveTransfer { cost, busy: false },
            FlowState::Approving { .. } => Panel::ApproveTransfer { cost, busy: true },
            FlowState::ReadyToCollect | FlowState::Approved => {
                Panel::ReadyToCollect { cost, busy: false }
            }
            FlowState::Collecting | FlowState::Confirming { .. } => Panel::Collecting,
            FlowState::Success { artifact } => Panel::Success {
                image_url: artifact.as_ref().map(|a| a.url.clone()),
                pieces: match &self.reservation {
                    Some(Reservation::Zodiac(reservation)) => reservation.pieces.clone(),
                    _ => Vec::new(),
                },
            },
            FlowState::Error { retry, .. } => match retry {
                RetryStep::Reservation | RetryStep::Balance => Panel::Loading,
                RetryStep::Approve => Panel::ApproveTransfer { cost, busy: false },
                RetryStep::Collect => Panel::ReadyToCollect { cost, busy: false },
                RetryStep::Reveal { .. } => Panel::Collecting,
            },
        }
    }

    fn quantity_panel(&self, costs: &CostTable) -> Panel {
        let FlowKind::Zodiac {
            sign, total_pieces, ..
        } = self.kind
        else {
            return Panel::Loading;
        };
        Panel::SelectQuantity {
            sign,
            unit_cost: costs.zodiac_piece.to_dollars(),
            projected_cost: self.cost(costs).to_dollars(),
            max: total_pieces,
            all_count: self.kind.all_count(),
        }
    }

    fn snapshot(&self, costs: &CostTable) -> FlowSnapshot {
        let error = match &self.state {
            FlowState::Error { message, .. } => Some(message.clone()),
            _ => None,
        };
        FlowSnapshot {
            id: self.id,
            state: self.state.name(),
            panel: self.panel(costs),
            error,
        }
    }
}

pub enum CollectRequest {
    OpenHoroscope {
        address: String,
        response: oneshot::Sender<Result<FlowSnapshot, ServiceError>>,
    },
    OpenZodiac {
        address: String,
        sign: ZodiacSign,
        total_pieces: u64,
        collected_pieces: u64,
        response: oneshot::Sender<Result<FlowSnapshot, ServiceError>>,
    },
    Act {
        flow_id: FlowId,
        action: FlowAction,
        response: oneshot::Sender<Result<FlowSnapshot, ServiceError>>,
    },
    GetFlow {
        flow_id: FlowId,
        response: oneshot::Sender<Result<FlowSnapshot, ServiceError>>,
    },
    /// Closing resets to nothing: the flow is removed and any completion
    /// still in flight is dropped when it comes back.
    Close {
        flow_id: FlowId,
        response: oneshot::Sender<Result<(), ServiceError>>,
    },
    /// Completion of a dispatched step. Never sent by callers.
    Internal {
        flow_id: FlowId,
        generation: u64,
        event: FlowEvent,
    },
}

/// Everything a dispatched command needs, captured while the flow entry is
/// held so no lock outlives the dispatch.
struct CommandCtx {
    flow_id: FlowId,
    generation: u64,
    address: Address,
    kind: FlowKind,
    quantity: Quantity,
    reservation: Option<Reservation>,
    cost: Usdc,
}

#[derive(Clone)]
pub struct CollectRequestHandler {
    backend: BackendApi,
    costs: CostTable,
    config: ChainConfig,
    flows: Arc<DashMap<FlowId, Flow>>,
    balance_channel: mpsc::Sender<BalanceRequest>,
    chain_channel: mpsc::Sender<ChainRequest>,
    user_channel: mpsc::Sender<UserRequest>,
    self_channel: mpsc::Sender<CollectRequest>,
}

impl CollectRequestHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: BackendApi,
        costs: CostTable,
        config: ChainConfig,
        balance_channel: mpsc::Sender<BalanceRequest>,
        chain_channel: mpsc::Sender<ChainRequest>,
        user_channel: mpsc::Sender<UserRequest>,
        self_channel: mpsc::Sender<CollectRequest>,
    ) -> Self {
        Self {
            backend,
            costs,
            config,
            flows: Arc::new(DashMap::new()),
            balance_channel,
            chain_channel,
            user_channel,
            self_channel,
        }
    }

    fn ctx(flow: &Flow, costs: &CostTable) -> CommandCtx {
        CommandCtx {
            flow_id: flow.id,
            generation: flow.generation,
            address: flow.address,
            kind: flow.kind,
            quantity: flow.quantity,
            reservation: flow.reservation.clone(),
            cost: flow.cost(costs),
        }
    }

    fn open(
        &self,
        flow: Flow,
        commands: Vec<Command>,
    ) -> Result<FlowSnapshot, ServiceError> {
        let snapshot = flow.snapshot(&self.costs);
        let ctx = Self::ctx(&flow, &self.costs);
        self.flows.insert(flow.id, flow);
        self.dispatch(ctx, commands);
        Ok(snapshot)
    }

    fn act(&self, flow_id: FlowId, action: FlowAction) -> Result<FlowSnapshot, ServiceError> {
        let mut entry = self
            .flows
            .get_mut(&flow_id)
            .ok_or_else(|| ServiceError::Validation("Unknown flow".to_string()))?;

        let commands = entry.on_action(action, &self.costs)?;
        let snapshot = entry.snapshot(&self.costs);
        let ctx = Self::ctx(&entry, &self.costs);
        drop(entry);

        self.dispatch(ctx, commands);
        Ok(snapshot)
    }

    fn apply_event(&self, flow_id: FlowId, generation: u64, event: FlowEvent) {
        let Some(mut entry) = self.flows.get_mut(&flow_id) else {
            log::debug!("Dropping completion for closed flow {}.", flow_id);
            return;
        };
        if entry.generation != generation {
            log::debug!("Dropping stale completion for flow {}.", flow_id);
            return;
        }

        let commands = entry.on_event(event, &self.costs);
        let ctx = Self::ctx(&entry, &self.costs);
        drop(entry);

        self.dispatch(ctx, commands);
    }

    fn dispatch(&self, ctx: CommandCtx, commands: Vec<Command>) {
        let CommandCtx {
            flow_id,
            generation,
            address,
            kind,
            quantity,
            reservation,
            cost,
        } = ctx;

        for command in commands {
            let events = self.self_channel.clone();
            let send = move |event: FlowEvent| async move {
                let _ = events
                    .send(CollectRequest::Internal {
                        flow_id,
                        generation,
                        event,
                    })
                    .await;
            };

            match command {
                Command::RequestReservation => {
                    let backend = self.backend.clone();
                    tokio::spawn(async move {
                        let result = match kind {
                            FlowKind::DailyHoroscope => backend
                                .request_daily_horoscope(address)
                                .await
                                .map(Reservation::Horoscope),
                            FlowKind::Zodiac { sign, .. } => {
                                let amount = match quantity {
                                    Quantity::All => None,
                                    Quantity::Count(n) => Some(n),
                                };
                                backend
                                    .request_zodiac(sign, address, amount)
                                    .await
                                    .map(Reservation::Zodiac)
                            }
                        };
                        let event = match result {
                            Ok(reservation) => FlowEvent::ReservationReady(reservation),
                            Err(e) => FlowEvent::ReservationFailed(e.to_string()),
                        };
                        send(event).await;
                    });
                }
                Command::FetchBalance => {
                    let channel = self.balance_channel.clone();
                    tokio::spawn(async move {
                        let (tx, rx) = oneshot::channel();
                        let request = BalanceRequest::GetBalance {
                            address: address.to_string(),
                            response: tx,
                        };
                        let event = match channel.send(request).await {
                            Err(e) => FlowEvent::BalanceFailed(e.to_string()),
                            Ok(()) => match rx.await {
                                Ok(Ok(snapshot)) => FlowEvent::BalanceReady(snapshot),
                                Ok(Err(e)) => FlowEvent::BalanceFailed(e.to_string()),
                                Err(e) => FlowEvent::BalanceFailed(e.to_string()),
                            },
                        };
                        send(event).await;
                    });
                }
                Command::SubmitApprove => {
                    let channel = self.chain_channel.clone();
                    let spender = match kind {
                        FlowKind::DailyHoroscope => self.config.daily_horoscope,
                        FlowKind::Zodiac { .. } => self.config.zodiac,
                    };
                    tokio::spawn(async move {
                        let (tx, rx) = oneshot::channel();
                        let request = ChainRequest::SubmitApprove {
                            owner: address,
                            spender,
                            amount: cost,
                            response: tx,
                        };
                        let event = match channel.send(request).await {
                            Err(e) => FlowEvent::ApproveFailed(e.to_string()),
                            Ok(()) => match rx.await {
                                Ok(Ok(hash)) => FlowEvent::ApproveSubmitted(hash),
                                Ok(Err(e)) => FlowEvent::ApproveFailed(e.to_string()),
                                Err(e) => FlowEvent::ApproveFailed(e.to_string()),
                            },
                        };
                        send(event).await;
                    });
                }
                Command::AwaitApproval(hash) => {
                    let channel = self.chain_channel.clone();
                    tokio::spawn(async move {
                        let (tx, rx) = oneshot::channel();
                        let request = ChainRequest::AwaitReceipt {
                            tx: hash,
                            response: tx,
                        };
                        let event = match channel.send(request).await {
                            Err(e) => FlowEvent::ApproveFailed(e.to_string()),
                            Ok(()) => match rx.await {
                                Ok(Ok(())) => FlowEvent::ApproveConfirmed,
                                Ok(Err(e)) => FlowEvent::ApproveFailed(e.to_string()),
                                Err(e) => FlowEvent::ApproveFailed(e.to_string()),
                            },
                        };
                        send(event).await;
                    });
                }
                Command::SubmitMint => {
                    let channel = self.chain_channel.clone();
                    let reservation = reservation.clone();
                    tokio::spawn(async move {
                        let (tx, rx) = oneshot::channel();
                        let request = match reservation {
                            Some(Reservation::Horoscope(reservation)) => {
                                ChainRequest::SubmitMintHoroscope {
                                    to: address,
                                    reservation,
                                    response: tx,
                                }
                            }
                            Some(Reservation::Zodiac(reservation)) => {
                                ChainRequest::SubmitMintZodiac {
                                    to: address,
                                    reservation,
                                    response: tx,
                                }
                            }
                            None => {
                                send(FlowEvent::MintFailed(
                                    "No reservation to mint".to_string(),
                                ))
                                .await;
                                return;
                            }
                        };
                        let event = match channel.send(request).await {
                            Err(e) => FlowEvent::MintFailed(e.to_string()),
                            Ok(()) => match rx.await {
                                Ok(Ok(hash)) => FlowEvent::MintSubmitted(hash),
                                Ok(Err(e)) => FlowEvent::MintFailed(e.to_string()),
                                Err(e) => FlowEvent::MintFailed(e.to_string()),
                            },
                        };
                        send(event).await;
                    });
                }
                Command::AwaitMint(hash) => {
                    let channel = self.chain_channel.clone();
                    tokio::spawn(async move {
                        let (tx, rx) = oneshot::channel();
                        let request = ChainRequest::AwaitReceipt {
                            tx: hash,
                            response: tx,
                        };
                        let event = match channel.send(request).await {
                            Err(e) => FlowEvent::MintFailed(e.to_string()),
                            Ok(()) => match rx.await {
                                Ok(Ok(())) => FlowEvent::MintConfirmed,
                                Ok(Err(e)) => FlowEvent::MintFailed(e.to_string()),
                                Err(e) => FlowEvent::MintFailed(e.to_string()),
                            },
                        };
                        send(event).await;
                    });
                }
                Command::Reveal(hash) => {
                    let backend = self.backend.clone();
                    let onchain_id = match &reservation {
                        Some(Reservation::Horoscope(reservation)) => Some(reservation.onchain_id),
                        _ => None,
                    };
                    tokio::spawn(async move {
                        let Some(onchain_id) = onchain_id else {
                            log::error!("Reveal requested without a horoscope reservation.");
                            return;
                        };
                        let event = match backend
                            .collect_daily_horoscope(onchain_id, address, hash)
                            .await
                        {
                            Ok(artifact) => FlowEvent::RevealReady(artifact),
                            // The user has paid on-chain at this point; the
                            // parked error keeps the hash for replay.
                            Err(e) => {
                                let error = ServiceError::Unrevealed {
                                    tx_hash: hash.to_string(),
                                    message: e.to_string(),
                                };
                                FlowEvent::RevealFailed {
                                    tx: hash,
                                    message: error.to_string(),
                                }
                            }
                        };
                        send(event).await;
                    });
                }
                Command::ConnectWallet => {
                    let channel = self.user_channel.clone();
                    tokio::spawn(async move {
                        let (tx, rx) = oneshot::channel();
                        let request = UserRequest::ConnectWallet {
                            address,
                            response: tx,
                        };
                        if channel.send(request).await.is_err() {
                            return;
                        }
                        match rx.await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => {
                                log::warn!("Could not record connected wallet: {}", e);
                            }
                            Err(e) => {
                                log::warn!("Could not record connected wallet: {}", e);
                            }
                        }
                    });
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler<CollectRequest> for CollectRequestHandler {
    async fn handle_request(&self, request: CollectRequest) {
        match request {
            CollectRequest::OpenHoroscope { address, response } => {
                let result = match address.parse::<Address>() {
                    Ok(address) => {
                        let (flow, commands) = Flow::open_horoscope(address);
                        self.open(flow, commands)
                    }
                    Err(e) => Err(ServiceError::Validation(format!("Bad address: {e}"))),
                };
                let _ = response.send(result);
            }
            CollectRequest::OpenZodiac {
                address,
                sign,
                total_pieces,
                collected_pieces,
                response,
            } => {
                let result = match address.parse::<Address>() {
                    Ok(address) => {
                        let (flow, commands) =
                            Flow::open_zodiac(address, sign, total_pieces, collected_pieces);
                        self.open(flow, commands)
                    }
                    Err(e) => Err(ServiceError::Validation(format!("Bad address: {e}"))),
                };
                let _ = response.send(result);
            }
            CollectRequest::Act {
                flow_id,
                action,
                response,
            } => {
                let _ = response.send(self.act(flow_id, action));
            }
            CollectRequest::GetFlow { flow_id, response } => {
                let result = self
                    .flows
                    .get(&flow_id)
                    .map(|flow| flow.snapshot(&self.costs))
                    .ok_or_else(|| ServiceError::Validation("Unknown flow".to_string()));
                let _ = response.send(result);
            }
            CollectRequest::Close { flow_id, response } => {
                self.flows.remove(&flow_id);
                let _ = response.send(Ok(()));
            }
            CollectRequest::Internal {
                flow_id,
                generation,
                event,
            } => {
                self.apply_event(flow_id, generation, event);
            }
        }
    }
}

pub struct CollectService;

impl CollectService {
    pub fn new() -> Self {
        CollectService {}
    }
}

#[async_trait]
impl Service<CollectRequest, CollectRequestHandler> for CollectService {}

#[cfg(test)]
mod tests {
    use super::*;

    fn costs() -> CostTable {
        CostTable {
            daily_horoscope: Usdc(1_000_000),
            zodiac_piece: Usdc(1_000_000),
        }
    }

    fn address() -> Address {
        Address([0x11; 20])
    }

    fn tx_hash() -> TxHash {
        TxHash([0xab; 32])
    }

    fn balance(balance: u128, horoscope: u128, zodiac: u128) -> BalanceSnapshot {
        BalanceSnapshot {
            usdc_balance: Usdc(balance),
            allowance_daily_horoscope: Usdc(horoscope),
            allowance_zodiac: Usdc(zodiac),
        }
    }

    fn horoscope_reservation() -> Reservation {
        Reservation::Horoscope(HoroscopeReservation {
            onchain_id: "0x01".parse().unwrap(),
            data_payload: "0xdeadbeef".parse().unwrap(),
        })
    }

    fn reserved_horoscope_flow(snapshot: BalanceSnapshot) -> Flow {
        let (mut flow, _) = Flow::open_horoscope(address());
        flow.on_event(FlowEvent::ReservationReady(horoscope_reservation()), &costs());
        flow.on_event(FlowEvent::BalanceReady(snapshot), &costs());
        flow
    }

    #[test]
    fn insufficient_balance_blocks_both_actions() {
        let mut flow = reserved_horoscope_flow(balance(500_000, 5_000_000, 0));

        assert_eq!(flow.state.name(), "awaiting_balance");
        assert!(matches!(
            flow.panel(&costs()),
            Panel::InsufficientBalance { .. }
        ));
        assert!(flow.on_action(FlowAction::Approve, &costs()).is_err());
        assert!(flow.on_action(FlowAction::Collect, &costs()).is_err());
    }

    #[test]
    fn missing_allowance_routes_through_approval() {
        let mut flow = reserved_horoscope_flow(balance(5_000_000, 0, 0));

        assert_eq!(flow.state.name(), "needs_approval");
        assert!(matches!(
            flow.panel(&costs()),
            Panel::ApproveTransfer { busy: false, .. }
        ));
        assert!(flow.on_action(FlowAction::Collect, &costs()).is_err());

        let commands = flow.on_action(FlowAction::Approve, &costs()).unwrap();
        assert_eq!(commands, vec![Command::SubmitApprove]);
        assert_eq!(flow.state.name(), "approving");
    }

    #[test]
    fn sufficient_funds_skip_approval_entirely() {
        let mut flow = reserved_horoscope_flow(balance(5_000_000, 5_000_000, 0));

        assert_eq!(flow.state.name(), "ready_to_collect");
        assert!(flow.on_action(FlowAction::Approve, &costs()).is_err());
        assert!(flow.on_action(FlowAction::Collect, &costs()).is_ok());
    }

    #[test]
    fn mint_waits_for_approval_confirmation() {
        let mut flow = reserved_horoscope_flow(balance(5_000_000, 0, 0));
        flow.on_action(FlowAction::Approve, &costs()).unwrap();

        // submitted but not yet confirmed: no way to collect
        let commands = flow.on_event(FlowEvent::ApproveSubmitted(tx_hash()), &costs());
        assert_eq!(
            commands,
            vec![Command::ConnectWallet, Command::AwaitApproval(tx_hash())]
        );
        assert!(flow.on_action(FlowAction::Collect, &costs()).is_err());

        // confirmation unlocks collection and refreshes the balance
        let commands = flow.on_event(FlowEvent::ApproveConfirmed, &costs());
        assert_eq!(commands, vec![Command::FetchBalance]);
        assert_eq!(flow.state.name(), "approved");
        assert!(flow.on_action(FlowAction::Collect, &costs()).is_ok());
    }

    #[test]
    fn horoscope_mint_confirmation_triggers_the_reveal() {
        let mut flow = reserved_horoscope_flow(balance(5_000_000, 5_000_000, 0));
        flow.on_action(FlowAction::Collect, &costs()).unwrap();

        flow.on_event(FlowEvent::MintSubmitted(tx_hash()), &costs());
        assert_eq!(flow.state.name(), "confirming");

        let commands = flow.on_event(FlowEvent::MintConfirmed, &costs());
        assert_eq!(commands, vec![Command::Reveal(tx_hash())]);

        flow.on_event(
            FlowEvent::RevealReady(CollectedHoroscope {
                date: "2026-08-05".to_string(),
                id: "h-1".to_string(),
                url: "https://blob.example/h-1.png".to_string(),
            }),
            &costs(),
        );
        assert_eq!(flow.state.name(), "success");
        match flow.panel(&costs()) {
            Panel::Success { image_url, .. } => {
                assert_eq!(image_url.as_deref(), Some("https://blob.example/h-1.png"));
            }
            other => panic!("expected the success panel, got {other:?}"),
        }
    }

    #[test]
    fn confirmation_without_a_hash_never_reaches_the_finalizer() {
        let mut flow = reserved_horoscope_flow(balance(5_000_000, 5_000_000, 0));
        flow.on_action(FlowAction::Collect, &costs()).unwrap();

        // still in `collecting`: no hash has been reported
        let commands = flow.on_event(FlowEvent::MintConfirmed, &costs());
        assert!(commands.is_empty());
        assert_eq!(flow.state.name(), "error");
    }

    #[test]
    fn reveal_failure_parks_the_flow_with_an_idempotent_retry() {
        let mut flow = reserved_horoscope_flow(balance(5_000_000, 5_000_000, 0));
        flow.on_action(FlowAction::Collect, &costs()).unwrap();
        flow.on_event(FlowEvent::MintSubmitted(tx_hash()), &costs());
        flow.on_event(FlowEvent::MintConfirmed, &costs());

        flow.on_event(
            FlowEvent::RevealFailed {
                tx: tx_hash(),
                message: "backend unavailable".to_string(),
            },
            &costs(),
        );
        assert_eq!(flow.state.name(), "error");

        let commands = flow.on_action(FlowAction::Retry, &costs()).unwrap();
        assert_eq!(commands, vec![Command::Reveal(tx_hash())]);
        assert_eq!(flow.state.name(), "confirming");
    }

    #[test]
    fn zodiac_quantity_change_discards_the_old_reservation() {
        let (mut flow, commands) = Flow::open_zodiac(address(), ZodiacSign::Leo, 10, 4);
        assert_eq!(commands, vec![Command::FetchBalance]);
        assert_eq!(flow.state.name(), "idle");

        let before = flow.generation;
        let commands = flow
            .on_action(FlowAction::SelectQuantity(Quantity::Count(2)), &costs())
            .unwrap();
        assert_eq!(commands, vec![Command::RequestReservation]);
        assert!(flow.generation > before);
        assert!(flow.reservation.is_none());
        assert_eq!(flow.state.name(), "requesting_reservation");
    }

    #[test]
    fn zodiac_cost_follows_the_reserved_piece_count() {
        let (mut flow, _) = Flow::open_zodiac(address(), ZodiacSign::Leo, 10, 4);
        // projection for "all": 6 uncollected pieces
        assert_eq!(flow.cost(&costs()), Usdc(6_000_000));

        flow.on_action(FlowAction::SelectQuantity(Quantity::Count(2)), &costs())
            .unwrap();
        flow.on_event(
            FlowEvent::ReservationReady(Reservation::Zodiac(ZodiacReservation {
                pieces: vec!["0x01".parse().unwrap(), "0x02".parse().unwrap()],
                data_payload: "0x".parse().unwrap(),
            })),
            &costs(),
        );
        assert_eq!(flow.cost(&costs()), Usdc(2_000_000));
    }

    #[test]
    fn zodiac_flow_completes_on_mint_confirmation() {
        let (mut flow, _) = Flow::open_zodiac(address(), ZodiacSign::Leo, 10, 4);
        flow.on_event(FlowEvent::BalanceReady(balance(20_000_000, 0, 20_000_000)), &costs());
        flow.on_action(FlowAction::SelectQuantity(Quantity::Count(2)), &costs())
            .unwrap();
        flow.on_event(
            FlowEvent::ReservationReady(Reservation::Zodiac(ZodiacReservation {
                pieces: vec!["0x01".parse().unwrap(), "0x02".parse().unwrap()],
                data_payload: "0xbeef".parse().unwrap(),
            })),
            &costs(),
        );
        assert_eq!(flow.state.name(), "ready_to_collect");

        flow.on_action(FlowAction::Collect, &costs()).unwrap();
        flow.on_event(FlowEvent::MintSubmitted(tx_hash()), &costs());
        let commands = flow.on_event(FlowEvent::MintConfirmed, &costs());
        assert!(commands.is_empty());
        assert_eq!(flow.state.name(), "success");
        match flow.panel(&costs()) {
            Panel::Success { pieces, image_url } => {
                assert_eq!(pieces.len(), 2);
                assert!(image_url.is_none());
            }
            other => panic!("expected the success panel, got {other:?}"),
        }
    }

    fn test_handler() -> (
        CollectRequestHandler,
        mpsc::Receiver<BalanceRequest>,
        mpsc::Receiver<ChainRequest>,
        mpsc::Receiver<UserRequest>,
        mpsc::Receiver<CollectRequest>,
    ) {
        let backend = BackendApi::new(&settings::Backend {
            url: "http://127.0.0.1:0".to_string(),
            blob_url: "http://127.0.0.1:0".to_string(),
            metadata_location: "metadata".to_string(),
        });
        let config = ChainConfig {
            chain_id: 8453,
            usdc: Address([0x01; 20]),
            daily_horoscope: Address([0x02; 20]),
            zodiac: Address([0x03; 20]),
        };
        let (balance_tx, balance_rx) = mpsc::channel(8);
        let (chain_tx, chain_rx) = mpsc::channel(8);
        let (user_tx, user_rx) = mpsc::channel(8);
        let (collect_tx, collect_rx) = mpsc::channel(8);
        let handler = CollectRequestHandler::new(
            backend, costs(), config, balance_tx, chain_tx, user_tx, collect_tx,
        );
        (handler, balance_rx, chain_rx, user_rx, collect_rx)
    }

    #[tokio::test]
    async fn completions_for_a_closed_flow_are_dropped() {
        let (handler, _balance_rx, _chain_rx, _user_rx, _collect_rx) = test_handler();

        let (flow, _) = Flow::open_horoscope(address());
        let flow_id = flow.id;
        handler.flows.insert(flow_id, flow);
        handler.flows.remove(&flow_id);

        // A late success against the closed instance must change nothing.
        handler
            .handle_request(CollectRequest::Internal {
                flow_id,
                generation: 0,
                event: FlowEvent::MintConfirmed,
            })
            .await;
        assert!(handler.flows.is_empty());
    }

    #[tokio::test]
    async fn stale_generation_completions_are_dropped() {
        let (handler, _balance_rx, _chain_rx, _user_rx, _collect_rx) = test_handler();

        let (mut flow, _) = Flow::open_zodiac(address(), ZodiacSign::Leo, 10, 0);
        flow.on_action(FlowAction::SelectQuantity(Quantity::Count(3)), &costs())
            .unwrap();
        let flow_id = flow.id;
        let current = flow.generation;
        handler.flows.insert(flow_id, flow);

        // a reservation that was requested before the quantity changed
        handler
            .handle_request(CollectRequest::Internal {
                flow_id,
                generation: current - 1,
                event: FlowEvent::ReservationReady(horoscope_reservation()),
            })
            .await;

        let entry = handler.flows.get(&flow_id).unwrap();
        assert!(entry.reservation.is_none());
        assert_eq!(entry.state.name(), "requesting_reservation");
    }
}
