use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::KiraError;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn retrieve_token(&self) -> Result<String, KiraError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
pub struct BasicAuthTokenClient {
    client: Client,
    auth_url: String,
    credentials: Credentials,
}

impl BasicAuthTokenClient {
    pub fn new(auth_url: impl Into<String>, credentials: Credentials) -> Result<Self, KiraError> {
        let client = Client::builder()
            .user_agent(format!("kira-au/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| KiraError::AuthHttp(err.to_string()))?;
        Ok(Self {
            client,
            auth_url: auth_url.into(),
            credentials,
        })
    }
}

#[async_trait]
impl TokenSource for BasicAuthTokenClient {
    async fn retrieve_token(&self) -> Result<String, KiraError> {
        let response = self
            .client
            .get(&self.auth_url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await
            .map_err(|err| KiraError::AuthHttp(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| KiraError::AuthHttp(err.to_string()))?;
        if !status.is_success() {
            return Err(KiraError::AuthStatus {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(body.trim().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    pub valid_duration_ms: i64,
    pub refresh_lead_ms: i64,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            valid_duration_ms: 10 * 60 * 1000,
            refresh_lead_ms: 2 * 60 * 1000,
        }
    }
}

impl TokenPolicy {
    pub fn is_usable(&self, issued_at_ms: i64, now_ms: i64) -> bool {
        now_ms + self.refresh_lead_ms <= issued_at_ms + self.valid_duration_ms
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, String>>>;

struct CachedToken {
    token: String,
    issued_at_ms: i64,
}

#[derive(Default)]
struct TokenState {
    cached: Option<CachedToken>,
    in_flight: Option<RefreshFuture>,
}

#[derive(Clone)]
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    policy: TokenPolicy,
    state: Arc<Mutex<TokenState>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>, policy: TokenPolicy) -> Self {
        Self::with_clock(source, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        source: Arc<dyn TokenSource>,
        policy: TokenPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            clock,
            policy,
            state: Arc::new(Mutex::new(TokenState::default())),
        }
    }

    pub async fn get_token(&self) -> Result<String, KiraError> {
        let refresh = {
            let mut state = self.state.lock();
            if let Some(cached) = &state.cached {
                if self
                    .policy
                    .is_usable(cached.issued_at_ms, self.clock.now_ms())
                {
                    return Ok(cached.token.clone());
                }
            }
            match &state.in_flight {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let refresh = self.start_refresh();
                    state.in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await.map_err(KiraError::AuthRefresh)
    }

    fn start_refresh(&self) -> RefreshFuture {
        let source = Arc::clone(&self.source);
        let clock = Arc::clone(&self.clock);
        let state: Weak<Mutex<TokenState>> = Arc::downgrade(&self.state);
        async move {
            debug!("refreshing archive token");
            let result = source.retrieve_token().await;
            let issued_at_ms = clock.now_ms();
            if let Some(state) = state.upgrade() {
                let mut state = state.lock();
                state.in_flight = None;
                state.cached = match &result {
                    Ok(token) => Some(CachedToken {
                        token: token.clone(),
                        issued_at_ms,
                    }),
                    Err(_) => None,
                };
            }
            result.map_err(|err| {
                warn!(error = %err, "token refresh failed");
                err.to_string()
            })
        }
        .boxed()
        .shared()
    }
}
