use anyhow::{Context, Result, bail};
use live_relay::hub::{HubConfig, OverflowPolicy};
use live_relay::log_stream::LogStreamSettings;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

// =============================================================================
// File config (figment-deserialized from defaults / deckhand.toml / env vars)
// =============================================================================
//
//   deckhand.toml:   [relay]
//                    client_queue = 512
//
//   env var:         DECKHAND_RELAY__CLIENT_QUEUE=512   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub log: LogFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub clusters: Vec<ClusterFileConfig>,
}

/// Listener address (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogFileConfig {
    /// `error`, `warn`, `info`, `debug`, `trace` or `off`. `RUST_LOG` wins.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Live relay tunables (lives under `[relay]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    /// Outbound queue per websocket client, in envelopes.
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
    /// What happens to a client whose queue is full.
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_log_chunk_bytes")]
    pub log_chunk_bytes: usize,
    #[serde(default = "default_log_idle_backoff_ms")]
    pub log_idle_backoff_ms: u64,
    /// Upper bound for opening any stream against a cluster.
    #[serde(default = "default_api_request_timeout_secs")]
    pub api_request_timeout_secs: u64,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            client_queue: default_client_queue(),
            overflow: OverflowPolicy::default(),
            log_chunk_bytes: default_log_chunk_bytes(),
            log_idle_backoff_ms: default_log_idle_backoff_ms(),
            api_request_timeout_secs: default_api_request_timeout_secs(),
        }
    }
}

/// One `[[clusters]]` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFileConfig {
    pub kubeconfig: PathBuf,
    /// Context to use; the kubeconfig's current context when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Identity shown to the dashboard; the API server URL when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_client_queue() -> usize {
    256
}
fn default_log_chunk_bytes() -> usize {
    2000
}
fn default_log_idle_backoff_ms() -> u64 {
    1000
}
fn default_api_request_timeout_secs() -> u64 {
    30
}

impl FileConfig {
    /// The defaults plus one example cluster, as printed by `deckhand config`.
    pub fn template() -> Self {
        Self {
            clusters: vec![ClusterFileConfig {
                kubeconfig: PathBuf::from("~/.kube/config"),
                context: None,
                name: None,
            }],
            ..Default::default()
        }
    }
}

/// Build a figment that layers: defaults → config file → DECKHAND_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `DECKHAND_SERVER__PORT=8080`  →  `server.port = 8080`
///   `DECKHAND_RELAY__OVERFLOW=drop_newest`  →  `relay.overflow = "drop_newest"`
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("DECKHAND_").split("__"))
}

/// Pick the config file: `--config` if given (it must exist), else
/// `./deckhand.toml`, else `~/.config/deckhand/config.toml`, else none.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        let path = expand_tilde(path);
        if !path.is_file() {
            bail!("config file not found: {}", path.display());
        }
        return Ok(Some(path));
    }

    let local = PathBuf::from("deckhand.toml");
    if local.is_file() {
        return Ok(Some(local));
    }

    Ok(dirs::home_dir()
        .map(|home| home.join(".config").join("deckhand").join("config.toml"))
        .filter(|path| path.is_file()))
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

// =============================================================================
// Runtime config (validated, used throughout the server)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub hub: HubConfig,
    pub logs: LogStreamSettings,
    pub api_request_timeout: Duration,
}

impl RelaySettings {
    pub fn from_file(fc: &RelayFileConfig) -> Self {
        let api_request_timeout = Duration::from_secs(fc.api_request_timeout_secs);
        Self {
            hub: HubConfig {
                client_queue: fc.client_queue,
                overflow: fc.overflow,
            },
            logs: LogStreamSettings {
                chunk_bytes: fc.log_chunk_bytes,
                idle_backoff: Duration::from_millis(fc.log_idle_backoff_ms),
                open_timeout: api_request_timeout,
            },
            api_request_timeout,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeckhandConfig {
    pub host: String,
    pub port: u16,
    pub log: LogFileConfig,
    pub relay: RelaySettings,
    pub clusters: Vec<ClusterFileConfig>,
}

impl DeckhandConfig {
    /// Validate a file config. `kubeconfig_env` is the value of `KUBECONFIG`;
    /// every path in it is added as one more cluster using its current
    /// context.
    pub fn from_file(fc: FileConfig, kubeconfig_env: Option<&OsStr>) -> Result<Self> {
        let mut clusters: Vec<ClusterFileConfig> = fc
            .clusters
            .into_iter()
            .map(|c| ClusterFileConfig {
                kubeconfig: expand_tilde(&c.kubeconfig),
                ..c
            })
            .collect();

        if let Some(value) = kubeconfig_env {
            for path in std::env::split_paths(value).filter(|p| !p.as_os_str().is_empty()) {
                let entry = ClusterFileConfig {
                    kubeconfig: path,
                    context: None,
                    name: None,
                };
                if !clusters.contains(&entry) {
                    clusters.push(entry);
                }
            }
        }

        if clusters.is_empty() {
            bail!("no clusters configured: add a [[clusters]] entry or set KUBECONFIG");
        }
        if fc.relay.client_queue == 0 {
            bail!("relay.client_queue must be greater than zero");
        }
        if fc.relay.log_chunk_bytes == 0 {
            bail!("relay.log_chunk_bytes must be greater than zero");
        }
        if fc.relay.api_request_timeout_secs == 0 {
            bail!("relay.api_request_timeout_secs must be greater than zero");
        }
        LevelFilter::from_str(&fc.log.level)
            .with_context(|| format!("invalid log.level {:?}", fc.log.level))?;

        Ok(Self {
            host: fc.server.host,
            port: fc.server.port,
            relay: RelaySettings::from_file(&fc.relay),
            log: fc.log,
            clusters,
        })
    }

    /// Default `EnvFilter` directive for the configured level.
    pub fn log_directive(&self) -> String {
        let level = &self.log.level;
        format!("deckhand={level},live_relay={level},tower_http={level},warn")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn with_cluster(mut fc: FileConfig) -> FileConfig {
        fc.clusters.push(ClusterFileConfig {
            kubeconfig: PathBuf::from("/etc/kube/a.yaml"),
            context: Some("prod".into()),
            name: None,
        });
        fc
    }

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let d = FileConfig::default();
        assert_eq!(d.server.host, "127.0.0.1");
        assert_eq!(d.server.port, 3000);
        assert_eq!(d.log.level, "info");
        assert!(!d.log.json);
        assert_eq!(d.relay.client_queue, 256);
        assert_eq!(d.relay.overflow, OverflowPolicy::Disconnect);
        assert_eq!(d.relay.log_chunk_bytes, 2000);
        assert_eq!(d.relay.log_idle_backoff_ms, 1000);
        assert_eq!(d.relay.api_request_timeout_secs, 30);
        assert!(d.clusters.is_empty());
    }

    #[test]
    fn test_relay_settings_from_file() {
        let settings = RelaySettings::from_file(&RelayFileConfig {
            client_queue: 8,
            overflow: OverflowPolicy::DropNewest,
            log_chunk_bytes: 512,
            log_idle_backoff_ms: 250,
            api_request_timeout_secs: 5,
        });
        assert_eq!(settings.hub.client_queue, 8);
        assert_eq!(settings.hub.overflow, OverflowPolicy::DropNewest);
        assert_eq!(settings.logs.chunk_bytes, 512);
        assert_eq!(settings.logs.idle_backoff, Duration::from_millis(250));
        assert_eq!(settings.logs.open_timeout, Duration::from_secs(5));
        assert_eq!(settings.api_request_timeout, Duration::from_secs(5));
    }

    // ── load_config ─────────────────────────────────────────────────────

    // Env vars are process-wide, so every test that extracts runs in a Jail.

    #[test]
    fn test_load_config_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let fc: FileConfig = load_config(None).extract()?;
            assert_eq!(fc.server.port, 3000);
            assert!(fc.clusters.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "deckhand.toml",
                r#"
[server]
port = 8080

[relay]
overflow = "drop_newest"
client_queue = 32

[[clusters]]
kubeconfig = "/etc/kube/a.yaml"
context = "prod"
name = "prod-eu"

[[clusters]]
kubeconfig = "/etc/kube/b.yaml"
"#,
            )?;

            let fc: FileConfig = load_config(Some(Path::new("deckhand.toml"))).extract()?;
            assert_eq!(fc.server.port, 8080);
            assert_eq!(fc.server.host, "127.0.0.1");
            assert_eq!(fc.relay.overflow, OverflowPolicy::DropNewest);
            assert_eq!(fc.relay.client_queue, 32);
            assert_eq!(fc.relay.log_chunk_bytes, 2000);
            assert_eq!(fc.clusters.len(), 2);
            assert_eq!(fc.clusters[0].name.as_deref(), Some("prod-eu"));
            assert_eq!(fc.clusters[1].context, None);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("deckhand.toml", "[server]\nport = 8080\n")?;
            jail.set_env("DECKHAND_SERVER__PORT", "9090");
            jail.set_env("DECKHAND_RELAY__CLIENT_QUEUE", "512");
            jail.set_env("DECKHAND_LOG__JSON", "true");

            let fc: FileConfig = load_config(Some(Path::new("deckhand.toml"))).extract()?;
            assert_eq!(fc.server.port, 9090);
            assert_eq!(fc.relay.client_queue, 512);
            assert!(fc.log.json);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_rejects_unknown_overflow() {
        Jail::expect_with(|jail| {
            jail.create_file("deckhand.toml", "[relay]\noverflow = \"block\"\n")?;
            assert!(load_config(Some(Path::new("deckhand.toml"))).extract::<FileConfig>().is_err());
            Ok(())
        });
    }

    #[test]
    fn test_template_parses_back() {
        let text = toml::to_string_pretty(&FileConfig::template()).unwrap();
        assert!(text.contains("[[clusters]]"));
        assert!(text.contains("client_queue = 256"));
        let parsed: FileConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.clusters.len(), 1);
        assert_eq!(parsed.relay.overflow, OverflowPolicy::Disconnect);
    }

    // ── resolve_config_path ─────────────────────────────────────────────

    #[test]
    fn test_explicit_config_must_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.toml");
        assert!(resolve_config_path(Some(&missing)).is_err());

        let present = tmp.path().join("deckhand.toml");
        std::fs::write(&present, "").unwrap();
        assert_eq!(resolve_config_path(Some(&present)).unwrap(), Some(present));
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde(Path::new("~/.kube/config")), home.join(".kube/config"));
        assert_eq!(expand_tilde(Path::new("/abs/path")), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde(Path::new("rel/~x")), PathBuf::from("rel/~x"));
    }

    // ── DeckhandConfig::from_file ───────────────────────────────────────

    #[test]
    fn test_from_file_requires_a_cluster() {
        let err = DeckhandConfig::from_file(FileConfig::default(), None).unwrap_err();
        assert!(err.to_string().contains("no clusters configured"));
    }

    #[test]
    fn test_kubeconfig_env_adds_clusters() {
        let joined = std::env::join_paths(["/tmp/one.yaml", "/tmp/two.yaml"]).unwrap();
        let config = DeckhandConfig::from_file(FileConfig::default(), Some(&joined)).unwrap();
        let paths: Vec<_> = config.clusters.iter().map(|c| c.kubeconfig.clone()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("/tmp/one.yaml"), PathBuf::from("/tmp/two.yaml")]
        );
    }

    #[test]
    fn test_kubeconfig_env_is_not_duplicated() {
        let mut fc = FileConfig::default();
        fc.clusters.push(ClusterFileConfig {
            kubeconfig: PathBuf::from("/tmp/one.yaml"),
            context: None,
            name: None,
        });
        let config =
            DeckhandConfig::from_file(fc, Some(OsStr::new("/tmp/one.yaml"))).unwrap();
        assert_eq!(config.clusters.len(), 1);
    }

    #[test]
    fn test_from_file_rejects_zero_sizes() {
        let mut fc = with_cluster(FileConfig::default());
        fc.relay.client_queue = 0;
        assert!(DeckhandConfig::from_file(fc, None).is_err());

        let mut fc = with_cluster(FileConfig::default());
        fc.relay.log_chunk_bytes = 0;
        assert!(DeckhandConfig::from_file(fc, None).is_err());

        let mut fc = with_cluster(FileConfig::default());
        fc.relay.api_request_timeout_secs = 0;
        assert!(DeckhandConfig::from_file(fc, None).is_err());
    }

    #[test]
    fn test_from_file_rejects_bad_log_level() {
        let mut fc = with_cluster(FileConfig::default());
        fc.log.level = "loud".into();
        let err = DeckhandConfig::from_file(fc, None).unwrap_err();
        assert!(err.to_string().contains("invalid log.level"));
    }

    #[test]
    fn test_log_directive() {
        let mut fc = with_cluster(FileConfig::default());
        fc.log.level = "debug".into();
        let config = DeckhandConfig::from_file(fc, None).unwrap();
        assert_eq!(
            config.log_directive(),
            "deckhand=debug,live_relay=debug,tower_http=debug,warn"
        );
    }
}
