use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use super::*;
use crate::{
    api::ApiResult,
    test_support::{auth_response, user},
};
use shared::domain::{Role, UserId};

#[derive(Default)]
struct FakeAuthApi {
    logins: AtomicUsize,
    refreshes: AtomicUsize,
    refresh_error: StdMutex<Option<ClientError>>,
}

impl FakeAuthApi {
    fn failing_refresh(err: ClientError) -> Self {
        let api = Self::default();
        *api.refresh_error.lock().expect("refresh error") = Some(err);
        api
    }
}

#[async_trait]
impl AuthApi for FakeAuthApi {
    async fn login(&self, _request: &LoginRequest) -> ApiResult<AuthResponse> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(auth_response(user(9, Role::Evaluator), "access-1", "refresh-1"))
    }

    async fn signup(&self, request: &SignupRequest) -> ApiResult<AuthResponse> {
        let mut created = user(12, request.role);
        created.full_name = request.full_name.clone();
        created.email = request.email.clone();
        Ok(auth_response(created, "access-1", "refresh-1"))
    }

    async fn refresh(&self, refresh_token: &str) -> ApiResult<AuthResponse> {
        assert_eq!(refresh_token, "refresh-1");
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Some(err) = self.refresh_error.lock().expect("refresh error").clone() {
            return Err(err);
        }
        Ok(auth_response(user(9, Role::Evaluator), "access-2", "refresh-2"))
    }

    async fn me(&self) -> ApiResult<User> {
        let mut me = user(9, Role::Evaluator);
        me.full_name = "Fresh Name".to_string();
        Ok(me)
    }

    async fn update_me(&self, request: &UpdateProfileRequest) -> ApiResult<User> {
        let mut me = user(9, Role::Evaluator);
        me.full_name = request.full_name.clone();
        me.phone = request.phone.clone().unwrap_or_default();
        Ok(me)
    }
}

fn login_request(email: &str, password: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: password.to_string(),
    }
}

async fn established(persistence: Arc<MemorySessionPersistence>) -> Arc<Session> {
    let session = Session::new(persistence);
    session
        .establish(auth_response(user(9, Role::Evaluator), "access-1", "refresh-1"))
        .await;
    session
}

#[tokio::test]
async fn restore_requires_both_tokens() {
    let persistence = Arc::new(MemorySessionPersistence::with_session(AuthSession {
        user: user(9, Role::Evaluator),
        access_token: "access-1".to_string(),
        refresh_token: String::new(),
    }));
    let session = Session::new(persistence.clone());
    assert_eq!(session.restore().await.expect("restore"), None);
    assert!(!session.is_authenticated());
    assert_eq!(persistence.stored(), None);

    let persistence = Arc::new(MemorySessionPersistence::with_session(AuthSession {
        user: user(9, Role::Evaluator),
        access_token: "access-1".to_string(),
        refresh_token: "refresh-1".to_string(),
    }));
    let session = Session::new(persistence);
    let restored = session.restore().await.expect("restore").expect("user");
    assert_eq!(restored.id, UserId(9));
    assert_eq!(session.access_token().as_deref(), Some("access-1"));
    assert_eq!(
        session.actor(),
        Some(Actor {
            id: UserId(9),
            role: Role::Evaluator
        })
    );
}

#[tokio::test]
async fn login_validates_before_calling_the_server() {
    let api = FakeAuthApi::default();
    let session = Session::in_memory();

    let err = session
        .login(&api, &login_request("nobody", "12"))
        .await
        .expect_err("invalid form");
    match err {
        ClientError::Validation(errors) => {
            assert!(errors.get("email").is_some());
            assert!(errors.get("password").is_some());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(api.logins.load(Ordering::SeqCst), 0);
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn login_persists_and_announces_the_session() {
    let api = FakeAuthApi::default();
    let persistence = Arc::new(MemorySessionPersistence::default());
    let session = Session::new(persistence.clone());
    let mut events = session.subscribe();

    let user = session
        .login(&api, &login_request("ana@example.com", "secret1"))
        .await
        .expect("login");
    assert_eq!(user.id, UserId(9));
    assert_eq!(
        events.recv().await.expect("event"),
        SessionEvent::Established(user.clone())
    );
    let stored = persistence.stored().expect("persisted");
    assert_eq!(stored.access_token, "access-1");
    assert_eq!(stored.refresh_token, "refresh-1");
}

#[tokio::test]
async fn signup_establishes_the_new_account() {
    let api = FakeAuthApi::default();
    let session = Session::in_memory();
    let request = SignupRequest {
        email: "bia@example.com".to_string(),
        full_name: "Bia Souza".to_string(),
        password: "secret1".to_string(),
        phone: None,
        role: Role::Evaluator,
        document_id: None,
        bio: None,
    };

    let created = session.signup(&api, &request).await.expect("signup");
    assert_eq!(created.role, Role::Evaluator);
    assert_eq!(session.user().map(|user| user.email), Some(request.email));
}

#[tokio::test]
async fn concurrent_refreshes_share_one_exchange() {
    let api = FakeAuthApi::default();
    let persistence = Arc::new(MemorySessionPersistence::default());
    let session = established(persistence.clone()).await;

    let (first, second) = tokio::join!(
        session.refresh_or_teardown(&api, "access-1"),
        session.refresh_or_teardown(&api, "access-1"),
    );
    assert_eq!(first.expect("first"), "access-2");
    assert_eq!(second.expect("second"), "access-2");
    assert_eq!(api.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(
        persistence.stored().map(|stored| stored.refresh_token),
        Some("refresh-2".to_string())
    );
}

#[tokio::test]
async fn rejected_refresh_ends_the_session() {
    let api = FakeAuthApi::failing_refresh(ClientError::Unauthorized("token revoked".to_string()));
    let persistence = Arc::new(MemorySessionPersistence::default());
    let session = established(persistence.clone()).await;
    let mut events = session.subscribe();

    let err = session
        .refresh_or_teardown(&api, "access-1")
        .await
        .expect_err("expired");
    assert!(matches!(err, ClientError::SessionExpired));
    assert!(!session.is_authenticated());
    assert_eq!(persistence.stored(), None);
    assert_eq!(
        events.recv().await.expect("event"),
        SessionEvent::Ended(SessionEndReason::Expired)
    );
}

#[tokio::test]
async fn transient_refresh_failure_keeps_the_session() {
    let api = FakeAuthApi::failing_refresh(ClientError::Transient("timeout".to_string()));
    let session = established(Arc::new(MemorySessionPersistence::default())).await;

    let err = session
        .refresh_or_teardown(&api, "access-1")
        .await
        .expect_err("transient");
    assert!(err.is_retryable());
    assert_eq!(session.access_token().as_deref(), Some("access-1"));
}

#[tokio::test]
async fn logout_clears_state_and_persistence() {
    let persistence = Arc::new(MemorySessionPersistence::default());
    let session = established(persistence.clone()).await;
    let mut events = session.subscribe();

    session.logout().await;
    assert!(session.current().is_none());
    assert_eq!(persistence.stored(), None);
    assert_eq!(
        events.recv().await.expect("event"),
        SessionEvent::Ended(SessionEndReason::LoggedOut)
    );

    // A second logout has nothing left to end.
    session.logout().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn profile_updates_refresh_the_cached_user() {
    let api = FakeAuthApi::default();
    let persistence = Arc::new(MemorySessionPersistence::default());
    let session = established(persistence.clone()).await;

    let me = session.load_me(&api).await.expect("me");
    assert_eq!(me.full_name, "Fresh Name");

    let invalid = UpdateProfileRequest {
        full_name: "A".to_string(),
        phone: None,
    };
    assert!(matches!(
        session.update_profile(&api, &invalid).await,
        Err(ClientError::Validation(_))
    ));

    let updated = session
        .update_profile(
            &api,
            &UpdateProfileRequest {
                full_name: "Ana Lima".to_string(),
                phone: Some("11988887777".to_string()),
            },
        )
        .await
        .expect("update");
    assert_eq!(updated.full_name, "Ana Lima");
    assert_eq!(session.user().map(|user| user.full_name), Some("Ana Lima".to_string()));
    assert_eq!(
        persistence.stored().map(|stored| stored.user.full_name),
        Some("Ana Lima".to_string())
    );
}

#[tokio::test]
async fn sqlite_storage_keeps_the_session_across_restarts() {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let first = Session::new(Arc::new(storage.clone()));
    first
        .establish(auth_response(user(9, Role::Evaluator), "access-1", "refresh-1"))
        .await;

    let second = Session::new(Arc::new(storage));
    let restored = second.restore().await.expect("restore").expect("user");
    assert_eq!(restored.id, UserId(9));
    assert_eq!(second.access_token().as_deref(), Some("access-1"));
}
