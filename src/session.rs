//! Session state and per-connection configuration
//!
//! The lifecycle is a tagged enum rather than a bundle of flags, so a claimed
//! but unprovisioned session cannot be expressed. Connectivity is tracked
//! separately and only ever changed by transport events.

use crate::config::DeviceConfig;
use crate::error::ParseError;
use crate::protocol::topics::{device_subscriptions, provisioning_subscriptions};
use std::fmt;
use std::time::Duration;

/// Longest access token accepted from provisioning or storage
pub const DEVICE_TOKEN_CAPACITY: usize = 127;

/// Username presented while the device has no token of its own
pub const PROVISIONING_USERNAME: &str = "provision";

/// Opaque access token, non-empty and at most 127 bytes
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceToken(String);

impl DeviceToken {
    pub fn new(value: impl Into<String>) -> Result<Self, ParseError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ParseError::InvalidToken("token is empty".to_string()));
        }
        if value.len() > DEVICE_TOKEN_CAPACITY {
            return Err(ParseError::InvalidToken(format!(
                "token is {} bytes, maximum is {DEVICE_TOKEN_CAPACITY}",
                value.len()
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Keep tokens out of debug output and logs
impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceToken(***)")
    }
}

/// Credential set presented when connecting
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Unprovisioned,
    Provisioned(DeviceToken),
}

/// Position in the onboarding lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    /// No token; the next connect starts provisioning
    Unprovisioned,
    /// Provisioning request published, waiting for the response
    AwaitingProvisionResponse,
    /// Token persisted; the restart worker will reconnect with it
    PendingRestart { token: DeviceToken },
    /// Provisioned, claim announcement not yet made
    Unclaimed { token: DeviceToken },
    /// Provisioned and claimed; steady state
    Claimed { token: DeviceToken },
}

impl LifecycleState {
    /// Initial state from the stored credentials
    pub fn from_stored(token: Option<DeviceToken>, claimed: bool) -> Self {
        match (token, claimed) {
            (None, _) => LifecycleState::Unprovisioned,
            (Some(token), false) => LifecycleState::Unclaimed { token },
            (Some(token), true) => LifecycleState::Claimed { token },
        }
    }

    pub fn identity(&self) -> Identity {
        match self {
            LifecycleState::Unprovisioned | LifecycleState::AwaitingProvisionResponse => {
                Identity::Unprovisioned
            }
            LifecycleState::PendingRestart { token }
            | LifecycleState::Unclaimed { token }
            | LifecycleState::Claimed { token } => Identity::Provisioned(token.clone()),
        }
    }

    pub fn is_provisioned(&self) -> bool {
        matches!(self.identity(), Identity::Provisioned(_))
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, LifecycleState::Claimed { .. })
    }

    /// Short name for log fields
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Unprovisioned => "unprovisioned",
            LifecycleState::AwaitingProvisionResponse => "awaiting_provision_response",
            LifecycleState::PendingRestart { .. } => "pending_restart",
            LifecycleState::Unclaimed { .. } => "unclaimed",
            LifecycleState::Claimed { .. } => "claimed",
        }
    }
}

/// Lifecycle state plus a mirror of transport connectivity
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    state: LifecycleState,
    connected: bool,
}

impl Session {
    pub fn new(state: LifecycleState) -> Self {
        Self {
            state,
            connected: false,
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn identity(&self) -> Identity {
        self.state.identity()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connected under the device's own token; anything else means "skip
    /// this cycle". A pending restart still holds the provisioning
    /// connection, so it is not ready.
    pub fn is_ready_for_telemetry(&self) -> bool {
        self.connected
            && matches!(
                self.state,
                LifecycleState::Unclaimed { .. } | LifecycleState::Claimed { .. }
            )
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    /// Mirrors transport events and the teardown of the live connection
    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Transport configuration for the identity this session presents now
    pub fn connect_options(&self, config: &DeviceConfig, device_name: &str) -> SessionOptions {
        SessionOptions::for_identity(&self.identity(), config, device_name)
    }
}

/// Everything the transport needs to open one connection
#[derive(Clone, PartialEq)]
pub struct SessionOptions {
    pub broker_url: String,
    pub client_name: String,
    pub username: String,
    pub keep_alive: Duration,
    pub reconnect_interval: Duration,
    pub subscriptions: Vec<String>,
}

impl SessionOptions {
    pub fn for_identity(identity: &Identity, config: &DeviceConfig, device_name: &str) -> Self {
        let (username, subscriptions) = match identity {
            Identity::Provisioned(token) => (token.as_str().to_string(), device_subscriptions()),
            Identity::Unprovisioned => {
                (PROVISIONING_USERNAME.to_string(), provisioning_subscriptions())
            }
        };

        Self {
            broker_url: config.mqtt.broker_url.clone(),
            client_name: device_name.to_string(),
            username,
            keep_alive: config.keep_alive(),
            reconnect_interval: config.reconnect_interval(),
            subscriptions,
        }
    }

    pub fn is_provisioning(&self) -> bool {
        self.username == PROVISIONING_USERNAME
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("broker_url", &self.broker_url)
            .field("client_name", &self.client_name)
            .field(
                "username",
                &if self.is_provisioning() {
                    PROVISIONING_USERNAME
                } else {
                    "***"
                },
            )
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(value: &str) -> DeviceToken {
        DeviceToken::new(value).unwrap()
    }

    #[test]
    fn test_token_bounds() {
        assert!(DeviceToken::new("").is_err());
        assert!(DeviceToken::new("a".repeat(DEVICE_TOKEN_CAPACITY)).is_ok());
        assert!(matches!(
            DeviceToken::new("a".repeat(DEVICE_TOKEN_CAPACITY + 1)),
            Err(ParseError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_token_debug_is_masked() {
        assert_eq!(format!("{:?}", token("secret-token")), "DeviceToken(***)");
    }

    #[test]
    fn test_state_from_stored_credentials() {
        assert_eq!(
            LifecycleState::from_stored(None, false),
            LifecycleState::Unprovisioned
        );
        // A leftover claim flag without a token does not make a claimed session
        assert_eq!(
            LifecycleState::from_stored(None, true),
            LifecycleState::Unprovisioned
        );
        assert_eq!(
            LifecycleState::from_stored(Some(token("tok")), false),
            LifecycleState::Unclaimed { token: token("tok") }
        );
        assert!(LifecycleState::from_stored(Some(token("tok")), true).is_claimed());
    }

    #[test]
    fn test_identity_per_state() {
        assert_eq!(
            LifecycleState::AwaitingProvisionResponse.identity(),
            Identity::Unprovisioned
        );
        assert_eq!(
            LifecycleState::PendingRestart { token: token("t") }.identity(),
            Identity::Provisioned(token("t"))
        );
    }

    #[test]
    fn test_ready_for_telemetry_requires_both() {
        let mut session = Session::new(LifecycleState::Unprovisioned);
        session.set_connected(true);
        assert!(!session.is_ready_for_telemetry());

        let mut session = Session::new(LifecycleState::Claimed { token: token("t") });
        assert!(!session.is_ready_for_telemetry());
        session.set_connected(true);
        assert!(session.is_ready_for_telemetry());
    }

    #[test]
    fn test_pending_restart_not_ready() {
        let mut session = Session::new(LifecycleState::PendingRestart { token: token("t") });
        session.set_connected(true);
        assert!(session.state().is_provisioned());
        assert!(!session.is_ready_for_telemetry());

        session.set_state(LifecycleState::Unclaimed { token: token("t") });
        assert!(session.is_ready_for_telemetry());
    }

    #[test]
    fn test_options_for_unprovisioned_identity() {
        let config = DeviceConfig::test_config();
        let session = Session::new(LifecycleState::Unprovisioned);
        let options = session.connect_options(&config, "test-device");

        assert_eq!(options.username, "provision");
        assert_eq!(options.subscriptions, vec!["/provision/response"]);
        assert!(options.is_provisioning());
        assert_eq!(options.reconnect_interval, Duration::from_millis(2000));
    }

    #[test]
    fn test_options_for_provisioned_identity() {
        let config = DeviceConfig::test_config();
        let session = Session::new(LifecycleState::Claimed { token: token("abc123") });
        let options = session.connect_options(&config, "test-device");

        assert_eq!(options.username, "abc123");
        assert_eq!(options.subscriptions.len(), 4);
        assert!(options
            .subscriptions
            .contains(&"v1/devices/me/rpc/request/+".to_string()));
        assert!(!format!("{options:?}").contains("abc123"));
    }
}
