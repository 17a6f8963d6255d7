use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use async_trait::async_trait;
use shared::{
    domain::User,
    protocol::{AuthResponse, LoginRequest, SignupRequest, UpdateProfileRequest},
};
use storage::Storage;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    api::AuthApi,
    error::ClientError,
    lifecycle::Actor,
    validation::{validate_login, validate_profile, validate_signup},
};

/// The authenticated user together with both tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
}

impl AuthSession {
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty()
    }
}

impl From<AuthResponse> for AuthSession {
    fn from(response: AuthResponse) -> Self {
        Self {
            user: response.user,
            access_token: response.access_token,
            refresh_token: response.refresh_token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    LoggedOut,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Established(User),
    Refreshed,
    UserUpdated(User),
    Ended(SessionEndReason),
}

/// Durable home of the session between runs.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<AuthSession>>;
    async fn save(&self, session: &AuthSession) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl SessionPersistence for Storage {
    async fn load(&self) -> anyhow::Result<Option<AuthSession>> {
        Ok(self.load_session().await?.map(|stored| AuthSession {
            user: stored.user,
            access_token: stored.access_token,
            refresh_token: stored.refresh_token,
        }))
    }

    async fn save(&self, session: &AuthSession) -> anyhow::Result<()> {
        self.save_session(&session.user, &session.access_token, &session.refresh_token)
            .await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.clear_session().await
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionPersistence {
    slot: StdMutex<Option<AuthSession>>,
}

impl MemorySessionPersistence {
    pub fn with_session(session: AuthSession) -> Self {
        Self {
            slot: StdMutex::new(Some(session)),
        }
    }

    pub fn stored(&self) -> Option<AuthSession> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SessionPersistence for MemorySessionPersistence {
    async fn load(&self) -> anyhow::Result<Option<AuthSession>> {
        Ok(self.stored())
    }

    async fn save(&self, session: &AuthSession) -> anyhow::Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Process-wide authentication state. Shared behind an `Arc` by the HTTP
/// client and every controller.
pub struct Session {
    state: RwLock<Option<AuthSession>>,
    persistence: Arc<dyn SessionPersistence>,
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub fn new(persistence: Arc<dyn SessionPersistence>) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            state: RwLock::new(None),
            persistence,
            refresh_lock: Mutex::new(()),
            events,
        })
    }

    pub fn in_memory() -> Arc<Self> {
        Self::new(Arc::new(MemorySessionPersistence::default()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn current(&self) -> Option<AuthSession> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn user(&self) -> Option<User> {
        self.current().map(|session| session.user)
    }

    pub fn actor(&self) -> Option<Actor> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| Actor::from(&session.user))
    }

    pub fn access_token(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    fn replace(&self, session: Option<AuthSession>) -> Option<AuthSession> {
        std::mem::replace(
            &mut *self.state.write().unwrap_or_else(PoisonError::into_inner),
            session,
        )
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Hydrates from persistence. A record missing either token is discarded.
    pub async fn restore(&self) -> Result<Option<User>, ClientError> {
        let stored = self
            .persistence
            .load()
            .await
            .map_err(|err| ClientError::Persistence(format!("{err:#}")))?;

        match stored {
            Some(session) if session.is_complete() => {
                let user = session.user.clone();
                info!(user_id = user.id.0, "session: restored");
                self.replace(Some(session));
                Ok(Some(user))
            }
            Some(_) => {
                warn!("session: discarding persisted session without both tokens");
                self.clear_persisted().await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn login(
        &self,
        api: &dyn AuthApi,
        request: &LoginRequest,
    ) -> Result<User, ClientError> {
        validate_login(request)?;
        let response = api.login(request).await?;
        Ok(self.establish(response).await)
    }

    pub async fn signup(
        &self,
        api: &dyn AuthApi,
        request: &SignupRequest,
    ) -> Result<User, ClientError> {
        validate_signup(request)?;
        let response = api.signup(request).await?;
        Ok(self.establish(response).await)
    }

    pub async fn establish(&self, response: AuthResponse) -> User {
        let session = AuthSession::from(response);
        let user = session.user.clone();
        self.persist(&session).await;
        self.replace(Some(session));
        info!(user_id = user.id.0, role = %user.role, "session: established");
        self.emit(SessionEvent::Established(user.clone()));
        user
    }

    /// Exchanges the refresh token after `rejected_token` was refused.
    ///
    /// Concurrent callers queue on one refresh; whoever arrives after a
    /// successful exchange gets the new token without another round trip.
    /// A transient failure leaves the session in place. Anything else ends it.
    pub async fn refresh_or_teardown(
        &self,
        api: &dyn AuthApi,
        rejected_token: &str,
    ) -> Result<String, ClientError> {
        let _guard = self.refresh_lock.lock().await;

        let Some(current) = self.current() else {
            return Err(ClientError::SessionExpired);
        };
        if current.access_token != rejected_token {
            debug!("session: token already refreshed by another request");
            return Ok(current.access_token);
        }
        if current.refresh_token.is_empty() {
            self.teardown(SessionEndReason::Expired).await;
            return Err(ClientError::SessionExpired);
        }

        match api.refresh(&current.refresh_token).await {
            Ok(response) => {
                let session = AuthSession::from(response);
                let token = session.access_token.clone();
                self.persist(&session).await;
                self.replace(Some(session));
                info!("session: access token refreshed");
                self.emit(SessionEvent::Refreshed);
                Ok(token)
            }
            Err(err) if err.is_retryable() => {
                warn!("session: refresh failed transiently: {err}");
                Err(err)
            }
            Err(err) => {
                warn!("session: refresh rejected, ending session: {err}");
                self.teardown(SessionEndReason::Expired).await;
                Err(ClientError::SessionExpired)
            }
        }
    }

    pub async fn load_me(&self, api: &dyn AuthApi) -> Result<User, ClientError> {
        let user = api.me().await?;
        self.update_user(user.clone()).await?;
        Ok(user)
    }

    pub async fn update_profile(
        &self,
        api: &dyn AuthApi,
        request: &UpdateProfileRequest,
    ) -> Result<User, ClientError> {
        validate_profile(request)?;
        let user = api.update_me(request).await?;
        self.update_user(user.clone()).await?;
        Ok(user)
    }

    async fn update_user(&self, user: User) -> Result<(), ClientError> {
        let updated = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let session = state.as_mut().ok_or(ClientError::NotAuthenticated)?;
            session.user = user.clone();
            session.clone()
        };
        self.persist(&updated).await;
        self.emit(SessionEvent::UserUpdated(user));
        Ok(())
    }

    pub async fn logout(&self) {
        self.teardown(SessionEndReason::LoggedOut).await;
    }

    /// Ends the session after the server refused a freshly refreshed token.
    pub(crate) async fn expire(&self) {
        self.teardown(SessionEndReason::Expired).await;
    }

    async fn teardown(&self, reason: SessionEndReason) {
        let previous = self.replace(None);
        self.clear_persisted().await;
        if previous.is_some() {
            info!(reason = ?reason, "session: ended");
            self.emit(SessionEvent::Ended(reason));
        }
    }

    async fn persist(&self, session: &AuthSession) {
        if let Err(err) = self.persistence.save(session).await {
            warn!("session: failed to persist session: {err:#}");
        }
    }

    async fn clear_persisted(&self) {
        if let Err(err) = self.persistence.clear().await {
            warn!("session: failed to clear persisted session: {err:#}");
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
