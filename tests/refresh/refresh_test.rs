//! Coverage for single-flight refresh-ahead-of-expiry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use stonebridge::refresh::{RefreshError, TokenCell, TokenRefresher, TokenSink};
use stonebridge::session::Token;

fn expiring_token(secs_left: i64) -> Token {
    Token {
        secret: "old".to_owned(),
        refresh_secret: Some("refresh".to_owned()),
        expires_at: Utc::now().checked_add_signed(chrono::Duration::seconds(secs_left)),
        kind: "bearer".to_owned(),
    }
}

struct CountingRefresher {
    calls: AtomicUsize,
    delay: Duration,
    fail: bool,
}

impl CountingRefresher {
    fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: true,
        }
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self, current: &Token) -> Result<Token, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(RefreshError::Failed("endpoint said no".to_owned()));
        }
        assert_eq!(current.secret, "old");
        Ok(Token {
            secret: "fresh".to_owned(),
            refresh_secret: current.refresh_secret.clone(),
            expires_at: Utc::now().checked_add_signed(chrono::Duration::seconds(3600)),
            kind: current.kind.clone(),
        })
    }
}

struct RecordingSink {
    seen: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl TokenSink for RecordingSink {
    async fn token_updated(&self, token: &Token) {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(token.secret.clone());
    }
}

#[tokio::test]
async fn refreshes_inside_the_margin_and_notifies_the_sink() {
    let cell = TokenCell::new(Duration::from_secs(45));
    cell.install(expiring_token(10));

    let sink = Arc::new(RecordingSink {
        seen: std::sync::Mutex::new(Vec::new()),
    });
    cell.set_sink(Arc::clone(&sink) as Arc<dyn TokenSink>);

    let refresher = CountingRefresher::new(Duration::ZERO);
    let token = cell.ensure_fresh(&refresher).await.expect("refresh");

    assert_eq!(token.secret, "fresh");
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    let seen = sink
        .seen
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    assert_eq!(seen, vec!["fresh".to_owned()]);
}

#[tokio::test]
async fn skips_refresh_outside_the_margin() {
    let cell = TokenCell::new(Duration::from_secs(45));
    cell.install(expiring_token(3600));

    let refresher = CountingRefresher::new(Duration::ZERO);
    let token = cell.ensure_fresh(&refresher).await.expect("no-op");

    assert_eq!(token.secret, "old");
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn tokens_without_expiry_never_refresh() {
    let cell = TokenCell::new(Duration::from_secs(45));
    cell.install(Token::bearer("forever"));

    let refresher = CountingRefresher::new(Duration::ZERO);
    let token = cell.ensure_fresh(&refresher).await.expect("no-op");

    assert_eq!(token.secret, "forever");
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let cell = Arc::new(TokenCell::new(Duration::from_secs(45)));
    cell.install(expiring_token(10));
    let refresher = Arc::new(CountingRefresher::new(Duration::from_millis(20)));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let cell = Arc::clone(&cell);
        let refresher = Arc::clone(&refresher);
        tasks.push(tokio::spawn(async move {
            cell.ensure_fresh(refresher.as_ref()).await
        }));
    }

    for task in tasks {
        let token = task.await.expect("task completes").expect("refresh ok");
        assert_eq!(token.secret, "fresh", "every caller observes the fresh token");
    }
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_refresh_leaves_the_token_unchanged() {
    let cell = TokenCell::new(Duration::from_secs(45));
    cell.install(expiring_token(10));

    let refresher = CountingRefresher::failing();
    let result = cell.ensure_fresh(&refresher).await;

    assert!(matches!(result, Err(RefreshError::Failed(_))));
    let current = cell.current().expect("token still installed");
    assert_eq!(current.secret, "old");
}

#[tokio::test]
async fn ensure_fresh_without_a_token_is_an_error() {
    let cell = TokenCell::new(Duration::from_secs(45));
    let refresher = CountingRefresher::new(Duration::ZERO);
    assert!(matches!(
        cell.ensure_fresh(&refresher).await,
        Err(RefreshError::NoToken)
    ));
}
