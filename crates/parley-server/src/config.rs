use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::warn;

use parley_bus::BrokerConfig;
use parley_gateway::GatewayConfig;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

/// FCM credentials. Push is disabled without them.
#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub project_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub node_id: String,
    pub gateway: GatewayConfig,
    pub broker: BrokerConfig,
    pub fcm: Option<FcmConfig>,
}

impl Config {
    /// Read `PARLEY_*` variables from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = lookup("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("PARLEY_JWT_SECRET is unset or still a placeholder");
        }

        let host = var("PARLEY_HOST", "0.0.0.0");
        let port: u16 = var("PARLEY_PORT", "3000")
            .parse()
            .context("PARLEY_PORT")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .context("PARLEY_HOST")?;

        // plain consumer groups are named after the node and outlive the process
        let node_id = match lookup("PARLEY_NODE_ID").filter(|v| !v.is_empty()) {
            Some(node_id) => node_id,
            None => {
                let node_id = format!("node-{}", std::process::id());
                warn!(%node_id, "PARLEY_NODE_ID not set, fan-out group will not survive a restart");
                node_id
            }
        };

        let defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            handshake_timeout: seconds(&lookup, "PARLEY_HANDSHAKE_TIMEOUT_SECS")?
                .unwrap_or(defaults.handshake_timeout),
            heartbeat_interval: seconds(&lookup, "PARLEY_HEARTBEAT_SECS")?
                .unwrap_or(defaults.heartbeat_interval),
        };

        let mut broker = BrokerConfig::default();
        if let Some(url) = lookup("PARLEY_REDIS_URL").filter(|v| !v.is_empty()) {
            broker.url = url;
        }
        if let Some(namespace) = lookup("PARLEY_BUS_NAMESPACE").filter(|v| !v.is_empty()) {
            broker.namespace = namespace;
        }
        if let Some(ack_wait) = seconds(&lookup, "PARLEY_BUS_ACK_WAIT_SECS")? {
            broker.ack_wait = ack_wait;
        }
        if let Some(max_deliver) = parsed::<u32>(&lookup, "PARLEY_BUS_MAX_DELIVER")? {
            // 0 means retry forever
            broker.max_deliver = Some(max_deliver).filter(|n| *n > 0);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "PARLEY_BUS_NAK_DELAY_MS")? {
            broker.nak_delay = Duration::from_millis(ms);
        }
        if let Some(max_retained) = parsed::<usize>(&lookup, "PARLEY_BUS_MAX_RETAINED")? {
            broker.max_retained = max_retained;
        }

        let fcm = match (
            lookup("PARLEY_FCM_PROJECT_ID").filter(|v| !v.is_empty()),
            lookup("PARLEY_FCM_ACCESS_TOKEN").filter(|v| !v.is_empty()),
        ) {
            (Some(project_id), Some(access_token)) => Some(FcmConfig {
                project_id,
                access_token,
            }),
            (None, None) => None,
            _ => bail!("PARLEY_FCM_PROJECT_ID and PARLEY_FCM_ACCESS_TOKEN must be set together"),
        };

        Ok(Self {
            addr,
            db_path: var("PARLEY_DB_PATH", "parley.db").into(),
            jwt_secret,
            node_id,
            gateway,
            broker,
            fcm,
        })
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> anyhow::Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.parse::<T>().with_context(|| format!("invalid {}: {:?}", key, raw)))
        .transpose()
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<Duration>> {
    Ok(parsed::<u64>(lookup, key)?.map(Duration::from_secs))
}
