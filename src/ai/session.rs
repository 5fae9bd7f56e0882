//! Per-conversation session state: current route, route lock and the age
//! verification flag.
//!
//! Sessions are authoritative in-process and optionally mirrored to the KV
//! store (last-writer-wins). The route-lock counter is decremented only
//! when a turn commits, never speculatively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::ai::classifier::SafetyLabel;
use crate::kv::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Route {
    Normal,
    Explicit,
    Fetish,
    Romance,
    Refused,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Normal => "NORMAL",
            Route::Explicit => "EXPLICIT",
            Route::Fetish => "FETISH",
            Route::Romance => "ROMANCE",
            Route::Refused => "REFUSED",
        }
    }

    /// Routes that pin the session when the user is age-verified.
    /// ROMANCE never locks.
    pub fn locks(&self) -> bool {
        matches!(self, Route::Explicit | Route::Fetish)
    }

    pub fn requires_age_verification(&self) -> bool {
        matches!(self, Route::Explicit | Route::Fetish)
    }
}

/// Map a classifier label to the conversation handling mode.
pub fn route_for(label: SafetyLabel) -> Route {
    match label {
        SafetyLabel::Safe | SafetyLabel::Suggestive => Route::Normal,
        SafetyLabel::ExplicitConsensualAdult => Route::Explicit,
        SafetyLabel::Fetish => Route::Fetish,
        SafetyLabel::MinorRisk | SafetyLabel::Nonconsensual | SafetyLabel::Refused => {
            Route::Refused
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub route: Route,
    pub route_lock_remaining: u32,
    pub age_verified: bool,
    pub last_activity: DateTime<Utc>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            route: Route::Normal,
            route_lock_remaining: 0,
            age_verified: false,
            last_activity: Utc::now(),
        }
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<(Uuid, Uuid), Arc<Mutex<SessionState>>>>,
    lock_turns: u32,
    idle_window: Duration,
    kv: Option<Arc<dyn KvStore>>,
}

impl SessionManager {
    pub fn new(lock_turns: u32, idle_window: Duration, kv: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            lock_turns,
            idle_window,
            kv,
        }
    }

    fn kv_key(user_id: Uuid, conversation_id: Uuid) -> String {
        format!("session:{user_id}:{conversation_id}")
    }

    /// Load or create the session for (user, conversation). Idle sessions
    /// are replaced by a fresh NORMAL session.
    pub async fn get_or_create(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Arc<Mutex<SessionState>> {
        let key = (user_id, conversation_id);

        if let Some(session) = self.sessions.read().await.get(&key) {
            let mut state = session.lock().await;
            if self.is_stale(&state) {
                *state = SessionState::default();
            }
            drop(state);
            return session.clone();
        }

        // Miss: consult the KV mirror before creating fresh state
        let initial = match &self.kv {
            Some(kv) => match kv.get(&Self::kv_key(user_id, conversation_id)).await {
                Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
                _ => SessionState::default(),
            },
            None => SessionState::default(),
        };
        let initial = if self.is_stale(&initial) { SessionState::default() } else { initial };

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(initial)))
            .clone()
    }

    fn is_stale(&self, state: &SessionState) -> bool {
        let idle = Utc::now().signed_duration_since(state.last_activity);
        idle.num_seconds() >= self.idle_window.as_secs() as i64
    }

    /// Route decision for the start of a turn: `Some(route)` when the lock
    /// is active and classification should be bypassed. The counter is not
    /// touched here.
    pub async fn locked_route(&self, session: &Arc<Mutex<SessionState>>) -> Option<Route> {
        let state = session.lock().await;
        if state.route_lock_remaining > 0 {
            Some(state.route)
        } else {
            None
        }
    }

    /// Commit the turn's route once the turn has reached its terminal
    /// event. A fresh EXPLICIT/FETISH classification on an age-verified
    /// session arms the lock so that the next N-1 turns bypass the
    /// classifier and the Nth reclassifies; a bypassed turn consumes one
    /// count.
    pub async fn commit_route(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        session: &Arc<Mutex<SessionState>>,
        route: Route,
        freshly_classified: bool,
    ) {
        let snapshot = {
            let mut state = session.lock().await;
            state.route = route;
            state.last_activity = Utc::now();

            if freshly_classified && route.locks() && state.age_verified {
                // The classified turn itself consumes the first count
                state.route_lock_remaining = self.lock_turns.saturating_sub(1);
            } else if !freshly_classified && state.route_lock_remaining > 0 {
                state.route_lock_remaining -= 1;
            } else if freshly_classified && !route.locks() {
                state.route_lock_remaining = 0;
            }
            state.clone()
        };
        self.mirror(user_id, conversation_id, &snapshot).await;
    }

    pub async fn set_age_verified(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        verified: bool,
    ) {
        let session = self.get_or_create(user_id, conversation_id).await;
        let snapshot = {
            let mut state = session.lock().await;
            state.age_verified = verified;
            state.last_activity = Utc::now();
            state.clone()
        };
        self.mirror(user_id, conversation_id, &snapshot).await;
    }

    pub async fn is_age_verified(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        let session = self.get_or_create(user_id, conversation_id).await;
        let state = session.lock().await;
        state.age_verified
    }

    async fn mirror(&self, user_id: Uuid, conversation_id: Uuid, state: &SessionState) {
        if let Some(kv) = &self.kv {
            if let Ok(encoded) = serde_json::to_string(state) {
                let _ = kv
                    .set(
                        &Self::kv_key(user_id, conversation_id),
                        encoded,
                        Some(self.idle_window),
                    )
                    .await;
            }
        }
    }

    /// Drop sessions idle beyond the configured window. Returns evictions.
    pub async fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut stale_keys = Vec::new();
        for (key, session) in sessions.iter() {
            let state = session.lock().await;
            if self.is_stale(&state) {
                stale_keys.push(*key);
            }
        }
        for key in &stale_keys {
            sessions.remove(key);
        }
        stale_keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(5, Duration::from_secs(24 * 3600), None)
    }

    #[tokio::test]
    async fn label_route_mapping() {
        assert_eq!(route_for(SafetyLabel::Safe), Route::Normal);
        assert_eq!(route_for(SafetyLabel::Suggestive), Route::Normal);
        assert_eq!(
            route_for(SafetyLabel::ExplicitConsensualAdult),
            Route::Explicit
        );
        assert_eq!(route_for(SafetyLabel::Fetish), Route::Fetish);
        assert_eq!(route_for(SafetyLabel::MinorRisk), Route::Refused);
        assert_eq!(route_for(SafetyLabel::Nonconsensual), Route::Refused);
    }

    #[tokio::test]
    async fn explicit_classification_locks_for_n_turns() {
        let mgr = manager();
        let (u, c) = (Uuid::new_v4(), Uuid::new_v4());
        mgr.set_age_verified(u, c, true).await;
        let session = mgr.get_or_create(u, c).await;

        // Turn 1: fresh explicit classification
        assert!(mgr.locked_route(&session).await.is_none());
        mgr.commit_route(u, c, &session, Route::Explicit, true).await;

        // Turns 2..=5 bypass classification and consume the lock
        for _ in 0..4 {
            assert_eq!(mgr.locked_route(&session).await, Some(Route::Explicit));
            mgr.commit_route(u, c, &session, Route::Explicit, false).await;
        }
        // Turn 6 reclassifies
        assert!(mgr.locked_route(&session).await.is_none());
    }

    #[tokio::test]
    async fn lock_requires_age_verification() {
        let mgr = manager();
        let (u, c) = (Uuid::new_v4(), Uuid::new_v4());
        let session = mgr.get_or_create(u, c).await;

        mgr.commit_route(u, c, &session, Route::Explicit, true).await;
        assert!(mgr.locked_route(&session).await.is_none());
    }

    #[tokio::test]
    async fn fresh_explicit_resets_the_counter() {
        let mgr = manager();
        let (u, c) = (Uuid::new_v4(), Uuid::new_v4());
        mgr.set_age_verified(u, c, true).await;
        let session = mgr.get_or_create(u, c).await;

        mgr.commit_route(u, c, &session, Route::Explicit, true).await;
        mgr.commit_route(u, c, &session, Route::Explicit, false).await;
        {
            let state = session.lock().await;
            assert_eq!(state.route_lock_remaining, 3);
        }
        mgr.commit_route(u, c, &session, Route::Fetish, true).await;
        let state = session.lock().await;
        assert_eq!(state.route_lock_remaining, 4);
    }

    #[tokio::test]
    async fn idle_sessions_are_replaced_with_fresh_normal() {
        let mgr = SessionManager::new(5, Duration::from_secs(0), None);
        let (u, c) = (Uuid::new_v4(), Uuid::new_v4());
        mgr.set_age_verified(u, c, true).await;
        let session = mgr.get_or_create(u, c).await;
        mgr.commit_route(u, c, &session, Route::Explicit, true).await;

        // Zero idle window: the next access sees a stale session
        let session = mgr.get_or_create(u, c).await;
        let state = session.lock().await;
        assert_eq!(state.route, Route::Normal);
        assert!(!state.age_verified);
    }

    #[tokio::test]
    async fn evict_idle_drops_stale_sessions() {
        let mgr = SessionManager::new(5, Duration::from_secs(0), None);
        let (u, c) = (Uuid::new_v4(), Uuid::new_v4());
        mgr.get_or_create(u, c).await;
        assert_eq!(mgr.evict_idle().await, 1);
    }
}
