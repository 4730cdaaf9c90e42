use std::collections::HashMap;
use std::ffi::OsString;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

use crate::error::{Result, SignalError};
use crate::producer::ProducerConfig;

pub const ENV_PREFIX: &str = "BALL_SIGNAL_";

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Settings every `SignalingSession` is created with.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub ice_servers: Vec<String>,
    pub ice_poll_interval: Duration,
    pub producer: ProducerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            ice_poll_interval: Duration::from_millis(100),
            producer: ProducerConfig::default(),
        }
    }
}

/// Process configuration, read from `BALL_SIGNAL_*` environment variables.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub host: IpAddr,
    pub http_port: u16,
    pub ws_port: u16,
    pub static_dir: String,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            http_port: 3030,
            ws_port: 4433,
            static_dir: "static".into(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(utf8_vars(std::env::vars_os()))
    }

    /// Build from any key/value source. Unprefixed keys are ignored; unset
    /// keys keep their defaults.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(k, v)| {
                k.as_ref()
                    .strip_prefix(ENV_PREFIX)
                    .map(|short| (short.to_owned(), v.into()))
            })
            .collect();

        let mut config = Config::default();
        if let Some(host) = parsed::<IpAddr>(&vars, "HOST")? {
            config.host = host;
        }
        if let Some(port) = parsed(&vars, "HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(port) = parsed(&vars, "WS_PORT")? {
            config.ws_port = port;
        }
        if let Some(dir) = vars.get("STATIC_DIR") {
            config.static_dir = dir.clone();
        }

        let session = &mut config.session;
        if let Some(list) = vars.get("STUN_SERVERS") {
            session.ice_servers = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(ms) = parsed::<u64>(&vars, "ICE_POLL_MS")? {
            if ms == 0 {
                return Err(SignalError::InvalidConfig("ICE_POLL_MS must be non-zero".into()));
            }
            session.ice_poll_interval = Duration::from_millis(ms);
        }

        let producer = &mut session.producer;
        if let Some(width) = parsed(&vars, "WIDTH")? {
            producer.width = width;
        }
        if let Some(height) = parsed(&vars, "HEIGHT")? {
            producer.height = height;
        }
        if let Some(fps) = parsed(&vars, "FPS")? {
            producer.fps = fps;
        }
        if let Some(radius) = parsed(&vars, "RADIUS")? {
            producer.radius = radius;
        }
        if let Some(capacity) = parsed(&vars, "BUFFER_CAPACITY")? {
            producer.buffer_capacity = capacity;
        }
        if let Some(threshold) = parsed(&vars, "DROP_THRESHOLD")? {
            producer.drop_threshold = threshold;
        }
        producer.validate()?;

        Ok(config)
    }
}

fn parsed<T>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            SignalError::InvalidConfig(format!("{}{}={:?}: {}", ENV_PREFIX, key, raw, e))
        }),
    }
}

/// Keep the pairs that are valid UTF-8. `std::env::vars` panics on the
/// rest, and a stray non-UTF-8 variable is no reason to refuse to start.
fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter().filter_map(|(k, v)| match (k.into_string(), v.into_string()) {
        (Ok(k), Ok(v)) => Some((k, v)),
        (k, _) => {
            let name = k.unwrap_or_else(|raw| raw.to_string_lossy().into_owned());
            if name.starts_with(ENV_PREFIX) {
                warn!("ignoring {}: value is not valid UTF-8", name);
            }
            None
        }
    })
}
