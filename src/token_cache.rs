use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use crate::types::Token;
use crate::Error;

/// Refresh a token this long before it actually expires.
pub(crate) const DEFAULT_EAGER_WINDOW: Duration = Duration::from_secs(300);

/// Per-credential token slot with coalesced, on-demand refresh
///
/// Every read goes through [`TokenCache::get_or_refresh`]: a token that is
/// still valid beyond the eager window is returned as-is; otherwise exactly
/// one caller performs the refresh while concurrent callers wait on the
/// refresh mutex and pick up the published result. There is no background
/// refresh task, so a dropped caller simply releases the mutex.
pub(crate) struct TokenCache {
    current: RwLock<Option<Arc<Token>>>,
    refresh: Mutex<()>,
    eager_window: Duration,
    force_refresh_on_failure: bool,
}

impl TokenCache {
    pub(crate) fn new(eager_window: Duration, force_refresh_on_failure: bool) -> Self {
        Self {
            current: RwLock::new(None),
            refresh: Mutex::new(()),
            eager_window,
            force_refresh_on_failure,
        }
    }

    pub(crate) async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<Arc<Token>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token, Error>>,
    {
        if let Some(token) = self.fresh() {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;

        // Check if a refresh happened while we were waiting for the lock.
        if let Some(token) = self.fresh() {
            return Ok(token);
        }

        match fetch().await {
            Ok(token) => {
                let token = Arc::new(token);
                *self.current.write().unwrap() = Some(token.clone());
                Ok(token)
            }
            Err(err) => {
                let stale = self.current.read().unwrap().clone();
                match (self.force_refresh_on_failure, stale) {
                    (true, Some(token)) => {
                        warn!(error = %err, "token refresh failed, serving stale token");
                        Ok(token)
                    }
                    _ => Err(err),
                }
            }
        }
    }

    fn fresh(&self) -> Option<Arc<Token>> {
        self.current
            .read()
            .unwrap()
            .as_ref()
            .filter(|token| !token.expires_within(self.eager_window))
            .cloned()
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("eager_window", &self.eager_window)
            .field("force_refresh_on_failure", &self.force_refresh_on_failure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn minted(label: &str) -> Token {
        Token::from_string(label.to_owned(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let cache = Arc::new(TokenCache::new(DEFAULT_EAGER_WINDOW, false));
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(|| async {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(minted("shared"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.as_str(), "shared");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn eager_window_triggers_refresh_before_expiry() {
        // Expires in one minute, eager window is five: must refresh.
        let cache = TokenCache::new(DEFAULT_EAGER_WINDOW, false);
        let soon = cache
            .get_or_refresh(|| async { Ok(Token::from_string("soon".into(), Duration::from_secs(60))) })
            .await
            .unwrap();
        assert_eq!(soon.as_str(), "soon");

        let replaced = cache
            .get_or_refresh(|| async { Ok(minted("fresh")) })
            .await
            .unwrap();
        assert_eq!(replaced.as_str(), "fresh");

        // The hour-long token survives further reads without fetching.
        let cached = cache
            .get_or_refresh(|| async { panic!("no refresh expected") })
            .await
            .unwrap();
        assert_eq!(cached.as_str(), "fresh");
    }

    #[tokio::test]
    async fn stale_token_served_when_forced() {
        let cache = TokenCache::new(DEFAULT_EAGER_WINDOW, true);
        cache
            .get_or_refresh(|| async { Ok(Token::from_string("stale".into(), Duration::from_secs(60))) })
            .await
            .unwrap();

        let token = cache
            .get_or_refresh(|| async { Err(Error::Str("refresh broke")) })
            .await
            .unwrap();
        assert_eq!(token.as_str(), "stale");
    }

    #[tokio::test]
    async fn refresh_failure_propagates_by_default() {
        let cache = TokenCache::new(DEFAULT_EAGER_WINDOW, false);
        cache
            .get_or_refresh(|| async { Ok(Token::from_string("stale".into(), Duration::from_secs(60))) })
            .await
            .unwrap();

        let err = cache
            .get_or_refresh(|| async { Err(Error::Str("refresh broke")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Str("refresh broke")));

        // The failure does not poison the cache; the next attempt succeeds.
        let token = cache
            .get_or_refresh(|| async { Ok(minted("recovered")) })
            .await
            .unwrap();
        assert_eq!(token.as_str(), "recovered");
    }
}
