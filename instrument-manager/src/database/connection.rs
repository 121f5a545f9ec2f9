// Database connection management
//
// DbConnector trait: lets the privileged-credential probe be tested deterministically without a
// real database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{ConnectOptions, MySql, Pool};
use std::time::Duration;
use tokio::time::timeout;

use crate::models::settings::DatabaseSettings;
use crate::utils::logging::mask_sensitive;

/// Error returned by connection attempts.
/// Keeps user-friendly messages separate from internal details.
#[derive(Debug, Clone)]
pub struct ConnectError {
    /// User-friendly message (safe to show in UI)
    pub user_message: String,
    /// Internal details for logging (never contains the password)
    pub internal_details: String,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user_message)
    }
}

impl std::error::Error for ConnectError {}

/// Credentials for one connection attempt.
#[derive(Debug, Clone)]
pub struct DbCredentials {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DbCredentials {
    pub fn from_settings(settings: &DatabaseSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            database: settings.database.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        }
    }

    /// Same server and database, different account.
    pub fn with_account(&self, username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            ..self.clone()
        }
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .password(&self.password)
    }
}

/// Trait for database connection attempts.
/// Production code uses RealDbConnector; tests use stubs.
#[async_trait]
pub trait DbConnector: Send + Sync {
    /// Attempt a connection; Ok(()) means the credentials were accepted.
    async fn connect(&self, credentials: &DbCredentials) -> Result<(), ConnectError>;

    fn timeout_duration(&self) -> Duration {
        Duration::from_secs(20)
    }
}

/// Production connector that opens (and immediately closes) a real MySQL connection.
pub struct RealDbConnector {
    pub timeout: Duration,
}

impl Default for RealDbConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
        }
    }
}

#[async_trait]
impl DbConnector for RealDbConnector {
    async fn connect(&self, credentials: &DbCredentials) -> Result<(), ConnectError> {
        let attempt = async {
            let conn = credentials.connect_options().connect().await?;
            sqlx::Connection::close(conn).await
        };

        match timeout(self.timeout_duration(), attempt).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectError {
                user_message: "Unable to connect. Verify host, credentials, and network access."
                    .to_string(),
                internal_details: format!("Connection error: {}", e),
            }),
            Err(_) => Err(ConnectError {
                user_message: "Connection timed out. Check network connectivity and firewall."
                    .to_string(),
                internal_details: "Connection attempt timed out".to_string(),
            }),
        }
    }

    fn timeout_duration(&self) -> Duration {
        self.timeout
    }
}

/// Whether the privileged ("quat") account is configured and usable.
///
/// Requires a non-empty user and password plus a successful live connection. Connection failures
/// are logged and reported as "not configured"; they never propagate.
pub async fn is_quat_user_configured(settings: &DatabaseSettings, connector: &dyn DbConnector) -> bool {
    let Some((user, password)) = settings.quat_credentials() else {
        info!("[PHASE: preflight] [STEP: quat_user] Privileged credentials are not set");
        return false;
    };

    let credentials = DbCredentials::from_settings(settings).with_account(user, password);
    match connector.connect(&credentials).await {
        Ok(()) => {
            info!(
                "[PHASE: preflight] [STEP: quat_user] Privileged account verified (user={})",
                mask_sensitive(user)
            );
            true
        }
        Err(e) => {
            warn!(
                "[PHASE: preflight] [STEP: quat_user] Privileged account unusable (user={}): {}",
                mask_sensitive(user),
                e.internal_details
            );
            false
        }
    }
}

/// MySQL pool used for read-only schema inspection.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<MySql>,
    database: String,
}

impl DatabaseConnection {
    pub async fn mysql(settings: &DatabaseSettings) -> Result<Self> {
        let credentials = DbCredentials::from_settings(settings);
        info!(
            "[PHASE: database] [STEP: connect] Connecting to {}:{}/{} as {}",
            credentials.host,
            credentials.port,
            credentials.database,
            mask_sensitive(&credentials.username)
        );

        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .connect_with(credentials.connect_options())
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to database {} on {}",
                    credentials.database, credentials.host
                )
            })?;

        Ok(Self {
            pool,
            database: settings.database.clone(),
        })
    }

    pub fn pool(&self) -> &Pool<MySql> {
        &self.pool
    }

    /// Schema name used in information_schema lookups.
    pub fn database_name(&self) -> &str {
        &self.database
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn settings() -> DatabaseSettings {
        DatabaseSettings {
            host: "db.local".to_string(),
            port: 3306,
            database: "LORIS".to_string(),
            username: "lorisuser".to_string(),
            password: "pw".to_string(),
            quat_user: Some("quatuser".to_string()),
            quat_password: Some("quatpass".to_string()),
            connect_timeout_secs: 1,
        }
    }

    /// Stub that records the account it was asked to use and returns a scripted result.
    struct RecordingStub {
        succeed: bool,
        calls: AtomicU32,
        last_user: Mutex<Option<String>>,
    }

    impl RecordingStub {
        fn new(succeed: bool) -> Self {
            Self {
                succeed,
                calls: AtomicU32::new(0),
                last_user: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl DbConnector for RecordingStub {
        async fn connect(&self, credentials: &DbCredentials) -> Result<(), ConnectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_user.lock().unwrap() = Some(credentials.username.clone());
            if self.succeed {
                Ok(())
            } else {
                Err(ConnectError {
                    user_message: "Unable to connect.".to_string(),
                    internal_details: "Access denied for user".to_string(),
                })
            }
        }
    }

    /// Stub that never returns; callers must bound it with a timeout.
    struct HangingStub;

    #[async_trait]
    impl DbConnector for HangingStub {
        async fn connect(&self, _credentials: &DbCredentials) -> Result<(), ConnectError> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn quat_check_uses_privileged_account() {
        let stub = RecordingStub::new(true);
        assert!(is_quat_user_configured(&settings(), &stub).await);
        assert_eq!(stub.last_user.lock().unwrap().as_deref(), Some("quatuser"));
    }

    #[tokio::test]
    async fn quat_check_without_credentials_never_connects() {
        let mut s = settings();
        s.quat_password = None;
        let stub = RecordingStub::new(true);
        assert!(!is_quat_user_configured(&s, &stub).await);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn quat_check_connection_failure_degrades_to_false() {
        let stub = RecordingStub::new(false);
        assert!(!is_quat_user_configured(&settings(), &stub).await);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hanging_connector_is_bounded_by_timeout() {
        let creds = DbCredentials::from_settings(&settings());
        let result = timeout(Duration::from_millis(50), HangingStub.connect(&creds)).await;
        assert!(result.is_err(), "hanging connect must be cut off by the caller");
    }

    #[test]
    fn connect_error_display_is_user_friendly() {
        let err = ConnectError {
            user_message: "Connection refused by server.".to_string(),
            internal_details: "tcp connect failed: errno=111".to_string(),
        };
        let displayed = err.to_string();
        assert_eq!(displayed, "Connection refused by server.");
        assert!(!displayed.contains("errno"));
    }

    #[test]
    fn with_account_keeps_server_and_database() {
        let creds = DbCredentials::from_settings(&settings()).with_account("quat", "secret");
        assert_eq!(creds.host, "db.local");
        assert_eq!(creds.database, "LORIS");
        assert_eq!(creds.username, "quat");
        assert_eq!(creds.password, "secret");
    }
}
