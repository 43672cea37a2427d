use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{oneshot, RwLock};

use super::{RequestHandler, Service, ServiceError};
use crate::chain::Address;
use crate::models::users::{ConnectedWallet, OnboardUser, User, UserSession};
use crate::repositories::backend::BackendApi;

/// How long a `/api/user/me` read stays fresh.
pub const USER_CACHE_TTL: Duration = Duration::from_secs(30);

pub enum UserRequest {
    GetMe {
        force_refresh: bool,
        response: oneshot::Sender<Result<UserSession, ServiceError>>,
    },
    CreateUser {
        response: oneshot::Sender<Result<User, ServiceError>>,
    },
    OnboardUser {
        input: OnboardUser,
        response: oneshot::Sender<Result<User, ServiceError>>,
    },
    UpdateDob {
        dob: String,
        response: oneshot::Sender<Result<User, ServiceError>>,
    },
    ConnectWallet {
        address: Address,
        response: oneshot::Sender<Result<ConnectedWallet, ServiceError>>,
    },
}

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

type CachedSession = Result<UserSession, String>;

/// TTL cache for the current-user read. One instance, owned by the user
/// service; both successful reads and failures are cached, so a flapping
/// backend is not hammered on every panel open.
pub struct UserCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    slot: RwLock<Option<(Instant, CachedSession)>>,
}

impl UserCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            slot: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Option<CachedSession> {
        let slot = self.slot.read().await;
        let (fetched_at, cached) = slot.as_ref()?;
        if self.clock.now().duration_since(*fetched_at) < self.ttl {
            Some(cached.clone())
        } else {
            None
        }
    }

    pub async fn store(&self, value: CachedSession) {
        *self.slot.write().await = Some((self.clock.now(), value));
    }

    pub async fn clear(&self) {
        *self.slot.write().await = None;
    }
}

#[derive(Clone)]
pub struct UserRequestHandler {
    backend: BackendApi,
    cache: Arc<UserCache>,
}

impl UserRequestHandler {
    pub fn new(backend: BackendApi) -> Self {
        Self::with_cache(
            backend,
            Arc::new(UserCache::new(USER_CACHE_TTL, Arc::new(SystemClock))),
        )
    }

    pub fn with_cache(backend: BackendApi, cache: Arc<UserCache>) -> Self {
        Self { backend, cache }
    }

    async fn get_me(&self, force_refresh: bool) -> Result<UserSession, ServiceError> {
        if !force_refresh {
            if let Some(cached) = self.cache.get().await {
                return cached.map_err(|e| ServiceError::Repository("User".to_string(), e));
            }
        }

        self.refetch_me().await
    }

    async fn refetch_me(&self) -> Result<UserSession, ServiceError> {
        match self.backend.me().await {
            Ok(session) => {
                self.cache.store(Ok(session.clone())).await;
                Ok(session)
            }
            Err(e) => {
                self.cache.store(Err(e.to_string())).await;
                Err(ServiceError::Repository("User".to_string(), e.to_string()))
            }
        }
    }

    async fn create_user(&self) -> Result<User, ServiceError> {
        let user = self
            .backend
            .create_user()
            .await
            .map_err(|e| ServiceError::Repository("User".to_string(), e.to_string()))?;
        let _ = self.refetch_me().await;
        Ok(user)
    }

    async fn onboard_user(&self, input: OnboardUser) -> Result<User, ServiceError> {
        if input.name.trim().is_empty() {
            return Err(ServiceError::Validation("Name is required".to_string()));
        }

        let user = self
            .backend
            .onboard_user(&input)
            .await
            .map_err(|e| ServiceError::Repository("User".to_string(), e.to_string()))?;
        let _ = self.refetch_me().await;
        Ok(user)
    }

    async fn update_dob(&self, dob: String) -> Result<User, ServiceError> {
        if dob.trim().is_empty() {
            return Err(ServiceError::Validation(
                "Date of birth is required".to_string(),
            ));
        }

        let user = self
            .backend
            .update_dob(&dob)
            .await
            .map_err(|e| ServiceError::Repository("User".to_string(), e.to_string()))?;
        let _ = self.refetch_me().await;
        Ok(user)
    }

    async fn connect_wallet(&self, address: Address) -> Result<ConnectedWallet, ServiceError> {
        self.backend
            .connect_wallet(address)
            .await
            .map_err(|e| ServiceError::Repository("User".to_string(), e.to_string()))
    }
}

#[async_trait]
impl RequestHandler<UserRequest> for UserRequestHandler {
    async fn handle_request(&self, request: UserRequest) {
        match request {
            UserRequest::GetMe {
                force_refresh,
                response,
            } => {
                let session = self.get_me(force_refresh).await;
                let _ = response.send(session);
            }
            UserRequest::CreateUser { response } => {
                let user = self.create_user().await;
                let _ = response.send(user);
            }
            UserRequest::OnboardUser { input, response } => {
                let user = self.onboard_user(input).await;
                let _ = response.send(user);
            }
            UserRequest::UpdateDob { dob, response } => {
                let user = self.update_dob(dob).await;
                let _ = response.send(user);
            }
            UserRequest::ConnectWallet { address, response } => {
                let wallet = self.connect_wallet(address).await;
                let _ = response.send(wallet);
            }
        }
    }
}

pub struct UserService;

impl UserService {
    pub fn new() -> Self {
        UserService {}
    }
}

#[async_trait]
impl Service<UserRequest, UserRequestHandler> for UserService {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    fn session() -> UserSession {
        UserSession {
            is_authenticated: true,
            user: None,
        }
    }

    #[tokio::test]
    async fn cache_serves_within_ttl_and_expires_after() {
        let clock = Arc::new(ManualClock::new());
        let cache = UserCache::new(Duration::from_secs(30), clock.clone());

        assert!(cache.get().await.is_none());
        cache.store(Ok(session())).await;

        clock.advance(Duration::from_secs(29));
        assert!(cache.get().await.is_some());

        clock.advance(Duration::from_secs(2));
        assert!(cache.get().await.is_none());
    }

    #[tokio::test]
    async fn cache_keeps_errors_too() {
        let clock = Arc::new(ManualClock::new());
        let cache = UserCache::new(Duration::from_secs(30), clock);

        cache.store(Err("backend down".to_string())).await;
        match cache.get().await {
            Some(Err(message)) => assert_eq!(message, "backend down"),
            other => panic!("expected a cached error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_empties_the_slot() {
        let clock = Arc::new(ManualClock::new());
        let cache = UserCache::new(Duration::from_secs(30), clock);

        cache.store(Ok(session())).await;
        cache.clear().await;
        assert!(cache.get().await.is_none());
    }
}
