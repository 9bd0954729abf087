//! Explicit session context handed to handlers and the task engine.

use std::collections::HashMap;
use std::sync::Mutex;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{ApiError, ApiErrorWithMeta, E_UNAUTHORIZED, api_error};
use crate::responses::{RequestMeta, new_meta};

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// An authenticated user plus a signal that fires when they sign out.
#[derive(Clone, Debug)]
pub struct Session {
    user_id: Uuid,
    signed_out: watch::Receiver<bool>,
}

/// The owning side of a [`Session`]. Dropping it counts as a sign-out.
#[derive(Debug)]
pub struct SessionHandle {
    tx: watch::Sender<bool>,
}

impl Session {
    pub fn open(user_id: Uuid) -> (Session, SessionHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Session {
                user_id,
                signed_out: rx,
            },
            SessionHandle { tx },
        )
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn is_signed_out(&self) -> bool {
        *self.signed_out.borrow() || self.signed_out.has_changed().is_err()
    }

    /// Resolves once the session has been signed out.
    pub async fn signed_out(&self) {
        let mut rx = self.signed_out.clone();
        // An error means the handle is gone, which is a sign-out as well.
        let _ = rx.wait_for(|out| *out).await;
    }
}

impl SessionHandle {
    pub fn sign_out(&self) {
        self.tx.send_replace(true);
    }
}

/// Live sessions by user id. A handle is kept only while some [`Session`]
/// for it is alive, typically a running countdown.
#[derive(Default)]
pub struct SessionRegistry {
    handles: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live session of `user_id`, opening one if needed.
    pub fn session_for(&self, user_id: Uuid) -> Session {
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        prune_idle(&mut handles);
        if let Some(handle) = handles.get(&user_id) {
            return Session {
                user_id,
                signed_out: handle.tx.subscribe(),
            };
        }
        let (session, handle) = Session::open(user_id);
        handles.insert(user_id, handle);
        session
    }

    /// Signs the user out. Returns false when no session was live.
    pub fn sign_out(&self, user_id: Uuid) -> bool {
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        match handles.remove(&user_id) {
            Some(handle) if handle.tx.receiver_count() > 0 => {
                handle.sign_out();
                info!(%user_id, "session signed out");
                true
            }
            _ => false,
        }
    }

    /// The number of live sessions.
    pub fn len(&self) -> usize {
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        prune_idle(&mut handles);
        handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prune_idle(handles: &mut HashMap<Uuid, SessionHandle>) {
    handles.retain(|_, h| h.tx.receiver_count() > 0);
}

fn request_meta(parts: &Parts) -> RequestMeta {
    parts
        .extensions
        .get::<RequestMeta>()
        .cloned()
        .unwrap_or_else(new_meta)
}

/// The caller's user id from the [`USER_ID_HEADER`] header. Extracting it
/// opens no session and does not check that the user exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserId(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ApiErrorWithMeta;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(UserId)
            .ok_or_else(|| {
                ApiError::Unauthorized(format!("missing or invalid {USER_ID_HEADER} header"))
                    .with_meta(request_meta(parts))
                    .with_code(E_UNAUTHORIZED)
            })
    }
}

/// Sessions are only opened for users the ledger knows.
impl FromRequestParts<AppState> for Session {
    type Rejection = ApiErrorWithMeta;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let UserId(user_id) = UserId::from_request_parts(parts, state).await?;
        state
            .service
            .user(user_id)
            .await
            .map_err(|e| api_error(e, &request_meta(parts)))?;
        Ok(state.sessions.session_for(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_out_wakes_waiters() {
        let registry = SessionRegistry::new();
        let user_id = Uuid::new_v4();
        let session = registry.session_for(user_id);
        assert!(!session.is_signed_out());

        let waiter = tokio::spawn({
            let session = session.clone();
            async move { session.signed_out().await }
        });
        assert!(registry.sign_out(user_id));
        waiter.await.unwrap();
        assert!(session.is_signed_out());
    }

    #[test]
    fn sessions_are_shared_until_sign_out() {
        let registry = SessionRegistry::new();
        let user_id = Uuid::new_v4();
        let first = registry.session_for(user_id);
        let second = registry.session_for(user_id);
        registry.sign_out(user_id);
        assert!(first.is_signed_out() && second.is_signed_out());

        let fresh = registry.session_for(user_id);
        assert!(!fresh.is_signed_out());
        assert!(!registry.sign_out(Uuid::new_v4()));
    }

    #[test]
    fn idle_sessions_are_forgotten() {
        let registry = SessionRegistry::new();
        for _ in 0..1_000 {
            registry.session_for(Uuid::new_v4());
        }
        assert!(registry.is_empty());

        let user_id = Uuid::new_v4();
        let held = registry.session_for(user_id);
        assert_eq!(registry.len(), 1);
        drop(held);
        assert!(registry.is_empty());
        assert!(!registry.sign_out(user_id));
    }

    #[test]
    fn dropped_handle_counts_as_sign_out() {
        let (session, handle) = Session::open(Uuid::new_v4());
        drop(handle);
        assert!(session.is_signed_out());
    }
}
