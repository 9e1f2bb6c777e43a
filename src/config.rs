//! Line-based configuration file
//!
//! One `key value...` pair per line, `#` starts a comment, blank lines are
//! ignored. Unknown keys are errors so typos do not silently disable
//! security options.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Default TCP listen port, shared with the upstream resolver.
pub const DEFAULT_PORT: u16 = 2593;

/// Default config path when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/uologin.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("{0}")]
    Invalid(String),
}

/// Where the metrics exporter listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsBind {
    Tcp(SocketAddr),
    /// A unix socket path; relative paths are resolved under
    /// `RUNTIME_DIRECTORY` when the listener is created.
    Unix(PathBuf),
}

/// A named shard offered to the client after authentication.
#[derive(Debug, Clone)]
pub struct ServerListItem {
    pub name: String,
    pub address: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub knock_port: Option<u16>,
    pub knock_nft_set: Option<String>,
    pub user_database: Option<PathBuf>,
    pub auto_reload_user_database: bool,
    /// Sole upstream, used when no server list is configured.
    pub game_server: Option<SocketAddr>,
    /// Named upstreams; non-empty enables the ServerList dialogue.
    pub server_list: Vec<ServerListItem>,
    pub send_remote_ip: bool,
    pub prometheus_exporter: Option<MetricsBind>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            knock_port: None,
            knock_nft_set: None,
            user_database: None,
            auto_reload_user_database: false,
            game_server: None,
            server_list: Vec::new(),
            send_remote_ip: false,
            prometheus_exporter: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        debug!(path = %path.display(), "loading configuration");
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let lineno = idx + 1;
            let (word, rest) = match line.split_once(char::is_whitespace) {
                Some((w, r)) => (w, r.trim()),
                None => (line, ""),
            };

            let err = |message: String| ConfigError::Parse {
                line: lineno,
                message,
            };

            match word {
                "port" => config.listen_port = parse_port(rest).map_err(err)?,
                "knock_port" => config.knock_port = Some(parse_port(rest).map_err(err)?),
                "knock_nft_set" => {
                    expect_value(rest).map_err(err)?;
                    config.knock_nft_set = Some(rest.to_owned());
                }
                "user_database" => {
                    expect_value(rest).map_err(err)?;
                    config.user_database = Some(PathBuf::from(rest));
                }
                "auto_reload_user_database" => {
                    config.auto_reload_user_database = parse_bool(rest).map_err(err)?;
                }
                "game_server" => parse_game_server(&mut config, rest).map_err(err)?,
                "send_remote_ip" => config.send_remote_ip = parse_bool(rest).map_err(err)?,
                "prometheus_exporter" => {
                    expect_value(rest).map_err(err)?;
                    config.prometheus_exporter = Some(parse_metrics_bind(rest));
                }
                _ => return Err(err(format!("unknown option {word:?}"))),
            }
        }

        config.finish()?;
        Ok(config)
    }

    fn finish(&mut self) -> Result<(), ConfigError> {
        if self.game_server.is_none() && self.server_list.is_empty() {
            return Err(ConfigError::Invalid("no game_server setting".into()));
        }

        if self.game_server.is_some() && !self.server_list.is_empty() {
            return Err(ConfigError::Invalid(
                "cannot mix a nameless game_server with a named server list".into(),
            ));
        }

        if self.knock_nft_set.is_some() && self.knock_port.is_none() {
            return Err(ConfigError::Invalid(
                "knock_nft_set requires knock_port".into(),
            ));
        }

        Ok(())
    }
}

fn expect_value(rest: &str) -> Result<(), String> {
    if rest.is_empty() {
        Err("missing value".into())
    } else {
        Ok(())
    }
}

fn parse_port(value: &str) -> Result<u16, String> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port {value:?}")),
        Ok(port) => Ok(port),
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(format!("invalid boolean {value:?}")),
    }
}

/// `game_server HOST[:PORT] [NAME]`: a nameless entry is the sole
/// upstream, named entries accumulate into the server list.
fn parse_game_server(config: &mut Config, rest: &str) -> Result<(), String> {
    let (host, name) = match rest.split_once(char::is_whitespace) {
        Some((h, n)) => (h, Some(n.trim())),
        None => (rest, None),
    };
    if host.is_empty() {
        return Err("missing value".into());
    }

    let address = resolve(host)?;

    match name {
        Some(name) => {
            if config.game_server.is_some() {
                return Err("cannot mix a nameless game_server with a named server list".into());
            }
            config.server_list.push(ServerListItem {
                name: name.to_owned(),
                address,
            });
        }
        None => {
            if config.game_server.is_some() || !config.server_list.is_empty() {
                return Err("only one nameless game_server is allowed".into());
            }
            config.game_server = Some(address);
        }
    }

    Ok(())
}

fn resolve(host: &str) -> Result<SocketAddr, String> {
    // Bare hosts get the default UO port; "HOST:PORT" and "[v6]:PORT"
    // pass through as-is.
    let candidate = if host.contains(':') && !host.starts_with('[') && host.matches(':').count() > 1
    {
        // unbracketed IPv6 literal
        format!("[{host}]:{DEFAULT_PORT}")
    } else if host.contains(':') {
        host.to_owned()
    } else {
        format!("{host}:{DEFAULT_PORT}")
    };

    candidate
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {host:?}: {e}"))?
        .next()
        .ok_or_else(|| format!("cannot resolve {host:?}: no addresses"))
}

fn parse_metrics_bind(value: &str) -> MetricsBind {
    match value.parse::<SocketAddr>() {
        Ok(addr) => MetricsBind::Tcp(addr),
        Err(_) => MetricsBind::Unix(PathBuf::from(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let config = Config::parse("game_server 127.0.0.1:2593\n").unwrap();
        assert_eq!(config.listen_port, DEFAULT_PORT);
        assert_eq!(
            config.game_server,
            Some("127.0.0.1:2593".parse().unwrap())
        );
        assert!(config.server_list.is_empty());
        assert!(!config.send_remote_ip);
    }

    #[test]
    fn comments_and_blank_lines() {
        let config = Config::parse(
            "# a comment\n\
             \n\
             port 2594  # trailing comment\n\
             game_server 127.0.0.1\n",
        )
        .unwrap();
        assert_eq!(config.listen_port, 2594);
        assert_eq!(
            config.game_server,
            Some("127.0.0.1:2593".parse().unwrap())
        );
    }

    #[test]
    fn server_list_accumulates_in_order() {
        let config = Config::parse(
            "game_server 127.0.0.1:2593 Alpha\n\
             game_server 127.0.0.2:2593 Beta\n",
        )
        .unwrap();
        assert!(config.game_server.is_none());
        assert_eq!(config.server_list.len(), 2);
        assert_eq!(config.server_list[0].name, "Alpha");
        assert_eq!(config.server_list[1].name, "Beta");
    }

    #[test]
    fn mixing_named_and_nameless_is_an_error() {
        assert!(Config::parse(
            "game_server 127.0.0.1:2593\n\
             game_server 127.0.0.2:2593 Beta\n"
        )
        .is_err());
        assert!(Config::parse(
            "game_server 127.0.0.2:2593 Beta\n\
             game_server 127.0.0.1:2593\n"
        )
        .is_err());
    }

    #[test]
    fn missing_game_server_is_an_error() {
        assert!(Config::parse("port 2593\n").is_err());
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(Config::parse("port 0\ngame_server 127.0.0.1\n").is_err());
        assert!(Config::parse("port 65536\ngame_server 127.0.0.1\n").is_err());
        assert!(Config::parse("send_remote_ip maybe\ngame_server 127.0.0.1\n").is_err());
        assert!(Config::parse("frobnicate 1\ngame_server 127.0.0.1\n").is_err());
    }

    #[test]
    fn knock_set_requires_knock_port() {
        assert!(Config::parse(
            "knock_nft_set uo\n\
             game_server 127.0.0.1\n"
        )
        .is_err());
        let config = Config::parse(
            "knock_port 2593\n\
             knock_nft_set uo\n\
             game_server 127.0.0.1\n",
        )
        .unwrap();
        assert_eq!(config.knock_port, Some(2593));
        assert_eq!(config.knock_nft_set.as_deref(), Some("uo"));
    }

    #[test]
    fn metrics_bind_forms() {
        let config = Config::parse(
            "prometheus_exporter 127.0.0.1:9100\n\
             game_server 127.0.0.1\n",
        )
        .unwrap();
        assert_eq!(
            config.prometheus_exporter,
            Some(MetricsBind::Tcp("127.0.0.1:9100".parse().unwrap()))
        );

        let config = Config::parse(
            "prometheus_exporter metrics.sock\n\
             game_server 127.0.0.1\n",
        )
        .unwrap();
        assert_eq!(
            config.prometheus_exporter,
            Some(MetricsBind::Unix(PathBuf::from("metrics.sock")))
        );
    }

    #[test]
    fn booleans() {
        for (text, expected) in [("yes", true), ("on", true), ("0", false), ("false", false)] {
            let config =
                Config::parse(&format!("send_remote_ip {text}\ngame_server 127.0.0.1\n")).unwrap();
            assert_eq!(config.send_remote_ip, expected);
        }
    }
}
