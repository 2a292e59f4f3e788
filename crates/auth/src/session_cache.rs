use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::AuthorizationToken;

#[derive(Debug, Clone)]
struct CachedSession {
    token: AuthorizationToken,
    resolved_at: DateTime<Utc>,
}

/// Process-wide memo of resolved tokens keyed by raw session credential.
///
/// An entry is served only while `now < expires_at - refresh_ahead`. Freshness
/// is judged when the entry is read, never when it is written.
#[derive(Clone)]
pub struct SessionCache {
    entries: Arc<RwLock<HashMap<String, CachedSession>>>,
    refresh_ahead: chrono::Duration,
}

const MAX_REFRESH_AHEAD: std::time::Duration = std::time::Duration::from_secs(3600);

impl SessionCache {
    /// Windows above one hour are clamped to one hour.
    pub fn new(refresh_ahead: std::time::Duration) -> Self {
        let window = if refresh_ahead > MAX_REFRESH_AHEAD {
            tracing::warn!(
                requested_secs = refresh_ahead.as_secs(),
                max_secs = MAX_REFRESH_AHEAD.as_secs(),
                "auth.refresh_ahead_clamped"
            );
            MAX_REFRESH_AHEAD
        } else {
            refresh_ahead
        };

        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            refresh_ahead: chrono::Duration::seconds(window.as_secs() as i64),
        }
    }

    pub async fn get_or_refresh<F, Fut, E>(
        &self,
        raw_credential: &str,
        refresh: F,
    ) -> Result<Option<AuthorizationToken>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<AuthorizationToken>, E>>,
    {
        self.get_or_refresh_at(raw_credential, Utc::now(), refresh)
            .await
    }

    pub async fn get_or_refresh_at<F, Fut, E>(
        &self,
        raw_credential: &str,
        now: DateTime<Utc>,
        refresh: F,
    ) -> Result<Option<AuthorizationToken>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<AuthorizationToken>, E>>,
    {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(raw_credential)
                && self.is_fresh(&entry.token, now)
            {
                return Ok(Some(entry.token.clone()));
            }
        }

        match refresh().await {
            Ok(Some(token)) => {
                let mut entries = self.entries.write().await;
                entries.insert(
                    raw_credential.to_string(),
                    CachedSession {
                        token: token.clone(),
                        resolved_at: now,
                    },
                );
                Ok(Some(token))
            }
            Ok(None) => {
                self.evict(raw_credential).await;
                Ok(None)
            }
            Err(err) => {
                self.evict(raw_credential).await;
                Err(err)
            }
        }
    }

    pub async fn evict(&self, raw_credential: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(raw_credential);
    }

    /// Drops every entry that would no longer be served at `now`.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| self.is_fresh(&entry.token, now));
        before - entries.len()
    }

    pub async fn resolved_at(&self, raw_credential: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().await;
        entries.get(raw_credential).map(|e| e.resolved_at)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn is_fresh(&self, token: &AuthorizationToken, now: DateTime<Utc>) -> bool {
        now < token.expires_at - self.refresh_ahead
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::{AuthError, UserInfo};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).expect("valid timestamp")
    }

    fn token(expires_at: i64) -> AuthorizationToken {
        AuthorizationToken {
            raw_token: format!("token-{}", expires_at),
            expires_at: at(expires_at),
            user: UserInfo {
                subject: "user-1".to_string(),
                email: "e@x".to_string(),
                first_name: None,
                last_name: None,
                roles: Vec::new(),
                site_identities: Vec::new(),
            },
        }
    }

    #[test]
    fn oversized_refresh_window_is_clamped() {
        let cache = SessionCache::new(Duration::from_secs(u64::MAX));
        assert_eq!(cache.refresh_ahead, chrono::Duration::seconds(3600));

        let cache = SessionCache::new(Duration::from_secs(90));
        assert_eq!(cache.refresh_ahead, chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn second_call_within_threshold_does_not_refresh() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for now in [1_000, 1_100] {
            let got = cache
                .get_or_refresh_at("cred", at(now), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, AuthError>(Some(token(4_600)))
                })
                .await
                .expect("refresh should succeed");
            assert!(got.is_some());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.resolved_at("cred").await, Some(at(1_000)));
    }

    #[tokio::test]
    async fn entry_near_expiry_is_refreshed() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        let refresh = |expiry| {
            let calls = &calls;
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AuthError>(Some(token(expiry)))
            }
        };

        cache
            .get_or_refresh_at("cred", at(1_000), refresh(1_100))
            .await
            .expect("first refresh");
        let got = cache
            .get_or_refresh_at("cred", at(1_050), refresh(5_000))
            .await
            .expect("second refresh")
            .expect("token present");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(got.expires_at, at(5_000));
    }

    #[tokio::test]
    async fn failed_refresh_evicts_stale_entry() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache
            .get_or_refresh_at("cred", at(1_000), || async {
                Ok::<_, AuthError>(Some(token(1_100)))
            })
            .await
            .expect("first refresh");
        assert_eq!(cache.len().await, 1);

        let got = cache
            .get_or_refresh_at("cred", at(1_060), || async { Ok::<_, AuthError>(None) })
            .await
            .expect("none is not an error");
        assert!(got.is_none());
        assert!(cache.is_empty().await);

        cache
            .get_or_refresh_at("cred", at(1_000), || async {
                Ok::<_, AuthError>(Some(token(1_100)))
            })
            .await
            .expect("refill");
        let err = cache
            .get_or_refresh_at("cred", at(1_060), || async {
                Err::<Option<AuthorizationToken>, _>(AuthError {
                    code: "ERR_AUTH_UNAVAILABLE",
                    message: "exchange down".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_UNAVAILABLE");
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn purge_expired_drops_only_stale_entries() {
        let cache = SessionCache::new(Duration::from_secs(60));
        for (cred, expiry) in [("a", 1_100), ("b", 9_000)] {
            cache
                .get_or_refresh_at(cred, at(1_000), || async move {
                    Ok::<_, AuthError>(Some(token(expiry)))
                })
                .await
                .expect("refresh");
        }

        assert_eq!(cache.purge_expired(at(1_050)).await, 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.resolved_at("b").await.is_some());
    }
}
