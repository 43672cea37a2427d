use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::art::ArtRequest;
use super::balance::BalanceRequest;
use super::collect::{CollectRequest, FlowAction, FlowId, Quantity};
use super::users::UserRequest;
use super::ServiceError;
use crate::chain::TokenId;
use crate::models::users::OnboardUser;
use crate::models::zodiac::ZodiacSign;

#[derive(Clone)]
struct AppState {
    collect_channel: mpsc::Sender<CollectRequest>,
    user_channel: mpsc::Sender<UserRequest>,
    balance_channel: mpsc::Sender<BalanceRequest>,
    art_channel: mpsc::Sender<ArtRequest>,
}

fn error_status(error: &ServiceError) -> StatusCode {
    match error {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn channel_closed() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
}

/// Awaits a service reply and renders it: the payload on success, the
/// error text otherwise.
async fn respond<T: Serialize>(
    rx: oneshot::Receiver<Result<T, ServiceError>>,
) -> (StatusCode, Json<Value>) {
    match rx.await {
        Ok(Ok(payload)) => (StatusCode::OK, Json(json!(payload))),
        Ok(Err(service_error)) => (
            error_status(&service_error),
            Json(json!({ "error": service_error.to_string() })),
        ),
        Err(_) => channel_closed(),
    }
}

fn parse_flow_id(raw: &str) -> Result<FlowId, (StatusCode, Json<Value>)> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Bad flow id" })),
        )
    })
}

#[derive(Deserialize)]
struct OpenHoroscopeBody {
    address: String,
}

async fn open_horoscope_flow(
    State(state): State<AppState>,
    Json(body): Json<OpenHoroscopeBody>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let sent = state
        .collect_channel
        .send(CollectRequest::OpenHoroscope {
            address: body.address,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenZodiacBody {
    address: String,
    sign: ZodiacSign,
    total_pieces: u64,
    collected_pieces: u64,
}

async fn open_zodiac_flow(
    State(state): State<AppState>,
    Json(body): Json<OpenZodiacBody>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let sent = state
        .collect_channel
        .send(CollectRequest::OpenZodiac {
            address: body.address,
            sign: body.sign,
            total_pieces: body.total_pieces,
            collected_pieces: body.collected_pieces,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

async fn get_flow(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let flow_id = match parse_flow_id(&id) {
        Ok(flow_id) => flow_id,
        Err(rejection) => return rejection,
    };

    let (tx, rx) = oneshot::channel();
    let sent = state
        .collect_channel
        .send(CollectRequest::GetFlow {
            flow_id,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

async fn act(state: &AppState, id: &str, action: FlowAction) -> (StatusCode, Json<Value>) {
    let flow_id = match parse_flow_id(id) {
        Ok(flow_id) => flow_id,
        Err(rejection) => return rejection,
    };

    let (tx, rx) = oneshot::channel();
    let sent = state
        .collect_channel
        .send(CollectRequest::Act {
            flow_id,
            action,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

#[derive(Deserialize)]
struct QuantityBody {
    amount: Quantity,
}

async fn select_quantity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<QuantityBody>,
) -> impl IntoResponse {
    act(&state, &id, FlowAction::SelectQuantity(body.amount)).await
}

async fn approve_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    act(&state, &id, FlowAction::Approve).await
}

async fn collect_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    act(&state, &id, FlowAction::Collect).await
}

async fn retry_flow(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    act(&state, &id, FlowAction::Retry).await
}

async fn close_flow(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let flow_id = match parse_flow_id(&id) {
        Ok(flow_id) => flow_id,
        Err(rejection) => return rejection,
    };

    let (tx, rx) = oneshot::channel();
    let sent = state
        .collect_channel
        .send(CollectRequest::Close {
            flow_id,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

#[derive(Deserialize)]
struct MeQuery {
    #[serde(default)]
    refresh: bool,
}

async fn get_me(State(state): State<AppState>, Query(query): Query<MeQuery>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let sent = state
        .user_channel
        .send(UserRequest::GetMe {
            force_refresh: query.refresh,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

async fn create_user(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let sent = state
        .user_channel
        .send(UserRequest::CreateUser { response: tx })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

async fn onboard_user(
    State(state): State<AppState>,
    Json(input): Json<OnboardUser>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let sent = state
        .user_channel
        .send(UserRequest::OnboardUser {
            input,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

#[derive(Deserialize)]
struct DobBody {
    dob: String,
}

async fn update_dob(
    State(state): State<AppState>,
    Json(body): Json<DobBody>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let sent = state
        .user_channel
        .send(UserRequest::UpdateDob {
            dob: body.dob,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

#[derive(Deserialize)]
struct BalanceQuery {
    address: String,
}

async fn get_balance(
    State(state): State<AppState>,
    Query(query): Query<BalanceQuery>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let sent = state
        .balance_channel
        .send(BalanceRequest::GetBalance {
            address: query.address,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

#[derive(Deserialize)]
struct GalleryQuery {
    zodiac_sign: Option<ZodiacSign>,
}

async fn get_zodiac_gallery(
    State(state): State<AppState>,
    Query(query): Query<GalleryQuery>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let sent = state
        .art_channel
        .send(ArtRequest::GetZodiacGallery {
            sign: query.zodiac_sign,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

async fn get_art_metadata(
    State(state): State<AppState>,
    Path(onchain_id): Path<String>,
) -> impl IntoResponse {
    let onchain_id: TokenId = match onchain_id.parse() {
        Ok(onchain_id) => onchain_id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Bad onchain id" })),
            )
        }
    };

    let (tx, rx) = oneshot::channel();
    let sent = state
        .art_channel
        .send(ArtRequest::GetArtMetadata {
            onchain_id,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

async fn get_horoscopes(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let sent = state
        .art_channel
        .send(ArtRequest::GetHoroscopes { response: tx })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

#[derive(Deserialize)]
struct HoroscopeDayQuery {
    date: Option<String>,
}

async fn get_horoscope_day(
    State(state): State<AppState>,
    Query(query): Query<HoroscopeDayQuery>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let sent = state
        .art_channel
        .send(ArtRequest::GetHoroscopeDay {
            date: query.date,
            response: tx,
        })
        .await;

    if sent.is_err() {
        return channel_closed();
    }
    respond(rx).await
}

pub async fn start_http_server(
    listen: String,
    collect_channel: mpsc::Sender<CollectRequest>,
    user_channel: mpsc::Sender<UserRequest>,
    balance_channel: mpsc::Sender<BalanceRequest>,
    art_channel: mpsc::Sender<ArtRequest>,
) -> Result<(), anyhow::Error> {
    let app_state = AppState {
        collect_channel,
        user_channel,
        balance_channel,
        art_channel,
    };

    let app = Router::new()
        .route("/flow/horoscope", post(open_horoscope_flow))
        .route("/flow/zodiac", post(open_zodiac_flow))
        .route("/flow/{id}", get(get_flow).delete(close_flow))
        .route("/flow/{id}/quantity", post(select_quantity))
        .route("/flow/{id}/approve", post(approve_flow))
        .route("/flow/{id}/collect", post(collect_flow))
        .route("/flow/{id}/retry", post(retry_flow))
        .route("/user/me", get(get_me))
        .route("/user/create", post(create_user))
        .route("/user/onboard", post(onboard_user))
        .route("/user/dob", post(update_dob))
        .route("/user/balance", get(get_balance))
        .route("/art/zodiac", get(get_zodiac_gallery))
        .route("/art/metadata/{onchain_id}", get(get_art_metadata))
        .route("/horoscopes", get(get_horoscopes))
        .route("/horoscopes/day", get(get_horoscope_day))
        .route("/health", get(|| async { "OK" }))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    println!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
