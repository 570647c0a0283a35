//! User authorization tickets
//!
//! A user ticket comes from a native token helper that talks to the
//! platform's account broker. The helper prints the base64 ticket on stdout
//! and reports failures through its exit code (an HRESULT).
//!
//! [`UserAuthorization`] wraps a [`TokenSource`] so the fetch happens at most
//! once per process: the first caller starts it and everyone else awaits the
//! same pending result.

use crate::config::Config;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

const NO_ACCOUNT: u32 = 0x8004_0200;
const FETCH_ERROR_BASE: u32 = 0x8004_0400;

/// Why a user ticket could not be obtained
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("No eligible account is signed in. Sign in to the store app with your account and try again.")]
    NoAccount,

    #[error("Sign-in was cancelled by the user.")]
    UserCancel,

    #[error("The account was switched during sign-in. Please try again.")]
    AccountSwitch,

    #[error("Interactive sign-in is required. Open the store app, sign in, and try again.")]
    InteractionRequired,

    #[error("The account service is unavailable. Try again later.")]
    ServiceUnavailable,

    #[error("The account provider reported an error.")]
    ProviderError,

    #[error("Unknown token helper failure (code 0x{:08X})", hresult(.0))]
    Unknown(i32),

    #[error("{0}")]
    Other(String),
}

fn hresult(code: &i32) -> u32 {
    *code as u32
}

impl TokenError {
    /// Map a token helper status code to a failure reason
    pub fn from_code(code: i32) -> Self {
        let status = code as u32;
        if status == NO_ACCOUNT {
            return TokenError::NoAccount;
        }
        if status & 0xFFFF_FF00 == FETCH_ERROR_BASE {
            return match status & 0xFF {
                1 => TokenError::UserCancel,
                2 => TokenError::AccountSwitch,
                3 => TokenError::InteractionRequired,
                4 => TokenError::ServiceUnavailable,
                5 => TokenError::ProviderError,
                _ => TokenError::Unknown(code),
            };
        }
        TokenError::Unknown(code)
    }
}

/// Something that can produce a user ticket
///
/// Fetching may block (it can show a sign-in prompt), so callers run it on a
/// blocking thread.
pub trait TokenSource: Send + Sync {
    fn fetch_token(&self) -> Result<String, TokenError>;
}

/// Runs the native token helper and reads the ticket from its stdout
pub struct HelperTokenSource {
    program: PathBuf,
}

impl HelperTokenSource {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl TokenSource for HelperTokenSource {
    fn fetch_token(&self) -> Result<String, TokenError> {
        debug!("Running token helper {}", self.program.display());
        let output = Command::new(&self.program).output().map_err(|e| {
            TokenError::Other(format!(
                "Failed to start token helper '{}': {}",
                self.program.display(),
                e
            ))
        })?;

        match output.status.code() {
            Some(0) => {
                let ticket = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if ticket.is_empty() {
                    return Err(TokenError::Other(
                        "Token helper returned an empty ticket".to_string(),
                    ));
                }
                Ok(ticket)
            }
            Some(code) => {
                let err = TokenError::from_code(code);
                warn!("Token helper failed with 0x{:08X}: {}", code as u32, err);
                Err(err)
            }
            None => Err(TokenError::Other(
                "Token helper was terminated by a signal".to_string(),
            )),
        }
    }
}

/// A fixed ticket, from configuration or the environment
pub struct StaticTokenSource(String);

impl StaticTokenSource {
    pub fn new(ticket: impl Into<String>) -> Self {
        Self(ticket.into())
    }
}

impl TokenSource for StaticTokenSource {
    fn fetch_token(&self) -> Result<String, TokenError> {
        Ok(self.0.clone())
    }
}

/// Pick the token source described by the configuration
pub fn source_from_config(config: &Config) -> Arc<dyn TokenSource> {
    match &config.auth.ticket {
        Some(ticket) => Arc::new(StaticTokenSource::new(ticket.clone())),
        None => Arc::new(HelperTokenSource::new(&config.auth.token_helper)),
    }
}

type TicketFuture = Shared<BoxFuture<'static, Result<String, TokenError>>>;

/// One-time, shared user authorization step
pub struct UserAuthorization {
    source: Arc<dyn TokenSource>,
    pending: OnceLock<TicketFuture>,
}

impl UserAuthorization {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            pending: OnceLock::new(),
        }
    }

    /// Get the user ticket, starting the authorization on first use
    ///
    /// The result (success or failure) is memoized for the lifetime of this
    /// value.
    pub async fn ticket(&self) -> Result<String, TokenError> {
        let pending = self
            .pending
            .get_or_init(|| {
                let source = Arc::clone(&self.source);
                async move {
                    info!("Requesting user authorization");
                    match tokio::task::spawn_blocking(move || source.fetch_token()).await {
                        Ok(result) => result,
                        Err(e) => Err(TokenError::Other(format!("Token task failed: {}", e))),
                    }
                }
                .boxed()
                .shared()
            })
            .clone();
        pending.await
    }

    pub fn is_started(&self) -> bool {
        self.pending.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSource {
        calls: AtomicUsize,
        result: Result<String, TokenError>,
    }

    impl TokenSource for CountingSource {
        fn fetch_token(&self) -> Result<String, TokenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.result.clone()
        }
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(TokenError::from_code(0x8004_0200u32 as i32), TokenError::NoAccount);
        assert_eq!(TokenError::from_code(0x8004_0401u32 as i32), TokenError::UserCancel);
        assert_eq!(TokenError::from_code(0x8004_0402u32 as i32), TokenError::AccountSwitch);
        assert_eq!(
            TokenError::from_code(0x8004_0403u32 as i32),
            TokenError::InteractionRequired
        );
        assert_eq!(
            TokenError::from_code(0x8004_0404u32 as i32),
            TokenError::ServiceUnavailable
        );
        assert_eq!(TokenError::from_code(0x8004_0405u32 as i32), TokenError::ProviderError);
        assert_eq!(TokenError::from_code(1), TokenError::Unknown(1));
    }

    #[test]
    fn test_unknown_code_display() {
        let msg = TokenError::from_code(0x8000_4005u32 as i32).to_string();
        assert!(msg.contains("0x80004005"), "{}", msg);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_fetch_once() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            result: Ok("ticket".to_string()),
        });
        let auth = Arc::new(UserAuthorization::new(source.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let auth = Arc::clone(&auth);
                tokio::spawn(async move { auth.ticket().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "ticket");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_memoized() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            result: Err(TokenError::NoAccount),
        });
        let auth = UserAuthorization::new(source.clone());

        assert!(!auth.is_started());
        assert_eq!(auth.ticket().await, Err(TokenError::NoAccount));
        assert_eq!(auth.ticket().await, Err(TokenError::NoAccount));
        assert!(auth.is_started());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_helper_is_reported() {
        let source = HelperTokenSource::new("/nonexistent/token-helper");
        match source.fetch_token() {
            Err(TokenError::Other(msg)) => assert!(msg.contains("Failed to start token helper")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_source_from_config_prefers_ticket() {
        let mut config = Config::default();
        config.auth.ticket = Some("abc".to_string());
        let source = source_from_config(&config);
        assert_eq!(source.fetch_token().unwrap(), "abc");
    }
}
