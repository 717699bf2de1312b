//! Agent configuration.
//!
//! The file is a YAML sequence of single-key maps, so a name may appear
//! more than once:
//!
//! ```yaml
//! - username: alice
//! - keys: /etc/telemetra/id_rsa
//! - server: https://telemetra.example.com/
//! - logging.level: info
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_yaml::Value as YamlValue;
use telemetra_core::validation::validate_username;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config entries must be single-key maps, found {0}")]
    Shape(String),
    #[error("missing config entry {0:?}")]
    Missing(&'static str),
    #[error("invalid config entry {name:?}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Flat name/value entries in file order.
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: Vec<(String, YamlValue)>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let items: Vec<YamlValue> = match serde_yaml::from_str(text)? {
            YamlValue::Null => Vec::new(),
            YamlValue::Sequence(items) => items,
            other => return Err(ConfigError::Shape(describe(&other))),
        };
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let map = match item {
                YamlValue::Mapping(map) => map,
                other => return Err(ConfigError::Shape(describe(&other))),
            };
            if map.len() != 1 {
                return Err(ConfigError::Shape(format!("a map with {} keys", map.len())));
            }
            for (key, value) in map {
                let name = match key {
                    YamlValue::String(name) => name,
                    other => return Err(ConfigError::Shape(describe(&other))),
                };
                entries.push((name, value));
            }
        }
        Ok(Config { entries })
    }

    /// Every value stored under `name`, in file order.
    pub fn entries(&self, name: &str) -> Vec<&YamlValue> {
        self.entries
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value)
            .collect()
    }

    /// The last value stored under `name`.
    pub fn entry(&self, name: &str) -> Option<&YamlValue> {
        self.entries(name).pop()
    }

    pub fn string(&self, name: &'static str) -> Result<Option<String>, ConfigError> {
        match self.entry(name) {
            None => Ok(None),
            Some(YamlValue::String(text)) => Ok(Some(text.clone())),
            Some(YamlValue::Number(number)) => Ok(Some(number.to_string())),
            Some(YamlValue::Bool(flag)) => Ok(Some(flag.to_string())),
            Some(other) => Err(ConfigError::Invalid {
                name,
                reason: format!("expected text, found {}", describe(other)),
            }),
        }
    }

    pub fn u64(&self, name: &'static str) -> Result<Option<u64>, ConfigError> {
        match self.entry(name) {
            None => Ok(None),
            Some(YamlValue::Number(number)) => number.as_u64().map(Some).ok_or_else(|| {
                ConfigError::Invalid {
                    name,
                    reason: format!("expected a non-negative integer, found {number}"),
                }
            }),
            Some(other) => Err(ConfigError::Invalid {
                name,
                reason: format!("expected a non-negative integer, found {}", describe(other)),
            }),
        }
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.string(name)?.ok_or(ConfigError::Missing(name))
    }
}

fn describe(value: &YamlValue) -> String {
    match value {
        YamlValue::Null => "null".into(),
        YamlValue::Bool(_) => "a boolean".into(),
        YamlValue::Number(_) => "a number".into(),
        YamlValue::String(_) => "a string".into(),
        YamlValue::Sequence(_) => "a list".into(),
        YamlValue::Mapping(_) => "a map".into(),
        YamlValue::Tagged(_) => "a tagged value".into(),
    }
}

/// Optional cron job publishing the agent's uptime.
#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub uri: String,
    pub cron: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub username: String,
    pub key_path: PathBuf,
    pub login_url: Url,
    pub ws_url: Url,
    pub log_level: String,
    pub reconnect_delay: Duration,
    pub workers: usize,
    pub maintenance_interval: Duration,
    pub heartbeat: Option<HeartbeatSettings>,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let username = config.required("username")?;
        validate_username(&username).map_err(|err| ConfigError::Invalid {
            name: "username",
            reason: err.to_string(),
        })?;
        let key_path = PathBuf::from(config.required("keys")?);

        let server = parse_url("server", &config.required("server")?)?;
        let login_url = match config.string("server.login")? {
            Some(url) => parse_url("server.login", &url)?,
            None => join_url("server", &server, "login")?,
        };
        let ws_url = match config.string("server.websocket")? {
            Some(url) => parse_url("server.websocket", &url)?,
            None => websocket_url(&server)?,
        };

        let heartbeat = match config.string("heartbeat.uri")? {
            Some(uri) => Some(HeartbeatSettings {
                uri,
                cron: config
                    .string("heartbeat.cron")?
                    .unwrap_or_else(|| "* * * * *".into()),
            }),
            None => None,
        };

        let workers = config.u64("session.workers")?.unwrap_or(5);
        if workers == 0 {
            return Err(ConfigError::Invalid {
                name: "session.workers",
                reason: "at least one worker is required".into(),
            });
        }

        Ok(Settings {
            username,
            key_path,
            login_url,
            ws_url,
            log_level: config
                .string("logging.level")?
                .unwrap_or_else(|| "info".into()),
            reconnect_delay: Duration::from_secs(
                config.u64("session.reconnect_delay_secs")?.unwrap_or(15),
            ),
            workers: usize::try_from(workers).unwrap_or(usize::MAX),
            maintenance_interval: Duration::from_secs(
                config.u64("store.maintenance_interval_secs")?.unwrap_or(300),
            ),
            heartbeat,
        })
    }
}

fn parse_url(name: &'static str, text: &str) -> Result<Url, ConfigError> {
    Url::parse(text).map_err(|err| ConfigError::Invalid {
        name,
        reason: err.to_string(),
    })
}

fn join_url(name: &'static str, base: &Url, path: &str) -> Result<Url, ConfigError> {
    base.join(path).map_err(|err| ConfigError::Invalid {
        name,
        reason: err.to_string(),
    })
}

/// `http(s)://host/base/` becomes `ws(s)://host/base/ws`.
fn websocket_url(server: &Url) -> Result<Url, ConfigError> {
    let mut url = join_url("server", server, "ws")?;
    let scheme = match server.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ConfigError::Invalid {
                name: "server",
                reason: format!("unsupported scheme {other:?}"),
            })
        }
    };
    url.set_scheme(scheme).map_err(|_| ConfigError::Invalid {
        name: "server",
        reason: format!("cannot use scheme {scheme:?}"),
    })?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "
- username: alice
- keys: /etc/telemetra/id_rsa
- server: https://telemetra.example.com/agents/
- logging.level: debug
- session.workers: 3
- tag: first
- tag: second
";

    #[test]
    fn entries_keep_every_value_in_order() {
        let config = Config::parse(SAMPLE).expect("config");
        let tags: Vec<&str> = config
            .entries("tag")
            .into_iter()
            .filter_map(YamlValue::as_str)
            .collect();
        assert_eq!(tags, vec!["first", "second"]);
        assert_eq!(config.string("tag").expect("tag"), Some("second".into()));
        assert!(config.entries("absent").is_empty());
    }

    #[test]
    fn settings_derive_urls_and_defaults() {
        let settings = Settings::from_config(&Config::parse(SAMPLE).expect("config")).expect("settings");
        assert_eq!(settings.username, "alice");
        assert_eq!(
            settings.login_url.as_str(),
            "https://telemetra.example.com/agents/login"
        );
        assert_eq!(settings.ws_url.as_str(), "wss://telemetra.example.com/agents/ws");
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.reconnect_delay, Duration::from_secs(15));
        assert_eq!(settings.maintenance_interval, Duration::from_secs(300));
        assert_eq!(settings.log_level, "debug");
        assert!(settings.heartbeat.is_none());
    }

    #[test]
    fn bad_configs_are_reported() {
        assert!(matches!(
            Config::parse("username: alice"),
            Err(ConfigError::Shape(_))
        ));
        assert!(matches!(
            Config::parse("- {a: 1, b: 2}"),
            Err(ConfigError::Shape(_))
        ));
        let missing = Config::parse("- username: alice").expect("config");
        assert!(matches!(
            Settings::from_config(&missing),
            Err(ConfigError::Missing("keys"))
        ));
        let bad_user = Config::parse("- username: bad user\n- keys: k\n- server: https://x/")
            .expect("config");
        assert!(matches!(
            Settings::from_config(&bad_user),
            Err(ConfigError::Invalid { name: "username", .. })
        ));
        let negative = Config::parse("- session.workers: -1").expect("config");
        assert!(negative.u64("session.workers").is_err());
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(SAMPLE.as_bytes()).expect("write");
        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.string("username").expect("username"), Some("alice".into()));
        assert!(matches!(
            Config::load(Path::new("/nonexistent/telemetra.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
