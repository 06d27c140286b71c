use serde::{Deserialize, Serialize};

/// Tunables for the `StreamsStore` engine. Loadable from TOML via
/// [`toml::from_str`]; every field has a documented default so an empty
/// document produces a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often to sweep the known-agents set with `PingUi` (ms).
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// How long an `InitSent`/`AcceptSent` handshake may sit idle before a
    /// fresh attempt is sent (ms).
    #[serde(default = "default_init_retry_threshold_ms")]
    pub init_retry_threshold_ms: u64,
    /// Informational-only threshold a UI can use to mark a peer's metadata
    /// as stale. The engine itself never acts on this value.
    #[serde(default = "default_stale_metadata_threshold_ms")]
    pub stale_metadata_threshold_ms: u64,
    /// Whether newly constructed `WebRTCPeer`s should prefer trickle ICE.
    #[serde(default = "default_true")]
    pub trickle_ice: bool,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            init_retry_threshold_ms: default_init_retry_threshold_ms(),
            stale_metadata_threshold_ms: default_stale_metadata_threshold_ms(),
            trickle_ice: true,
            ice_servers: default_ice_servers(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.ping_interval_ms == 0 {
            issues.push("ERROR: ping_interval_ms must be greater than 0.".to_string());
        }
        if self.init_retry_threshold_ms < self.ping_interval_ms {
            issues.push(format!(
                "WARNING: init_retry_threshold_ms ({}) is shorter than ping_interval_ms ({}); \
                 retries will fire on every pong instead of every few pongs.",
                self.init_retry_threshold_ms, self.ping_interval_ms
            ));
        }
        if self.ice_servers.is_empty() {
            issues.push(
                "WARNING: ice_servers is empty; peers behind NAT will likely fail to connect."
                    .to_string(),
            );
        }
        for server in &self.ice_servers {
            for url in &server.urls {
                if !url.starts_with("stun:")
                    && !url.starts_with("stuns:")
                    && !url.starts_with("turn:")
                    && !url.starts_with("turns:")
                {
                    issues.push(format!(
                        "ERROR: ICE server URL '{url}' must start with stun:, stuns:, turn:, or turns:."
                    ));
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_ping_interval_ms() -> u64 {
    2_000
}

fn default_init_retry_threshold_ms() -> u64 {
    5_000
}

fn default_stale_metadata_threshold_ms() -> u64 {
    (default_ping_interval_ms() as f64 * 2.8) as u64
}

fn default_true() -> bool {
    true
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig {
            urls: vec!["stun:global.stun.twilio.com:3478".to_string()],
            username: None,
            credential: None,
        },
        IceServerConfig {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        },
    ]
}
