use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::edgetunnel::tunnel::{
    connections::DEFAULT_DIAL_TIMEOUT, engine, packet::Annotations, transport::TransportKind,
};

pub const CONFIG_ENV: &str = "EDGETUNNEL_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps the env var into the flag already; this covers callers that
    // bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("edgetunnel.toml"));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["edgetunnel.toml", "edgetunnel.yaml", "edgetunnel.yml"];
    for c in candidates {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no edgetunnel.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/edgetunnel/edgetunnel.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("com", "summpot", "edgetunnel")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("edgetunnel.toml"))
    }
}

/// Writes the default template to `path` unless a file is already there.
/// Returns whether it created one.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension_of(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        ext => anyhow::bail!("config: unsupported config extension {ext}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub peer_id: String,
    pub admin_addr: String,
    pub annotations: Annotations,
    pub logging: LoggingConfig,
    pub tunnel: TunnelConfig,
    pub forwards: Vec<ForwardConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub auth_token: String,
    pub peer_tokens: HashMap<String, String>,
    pub handshake_timeout: Duration,
    /// Zero disables keepalives.
    pub keepalive_interval: Duration,
    /// Zero disables periodic refresh.
    pub refresh_interval: Duration,
    pub max_pending_opens: usize,
    pub endpoints: Vec<TunnelEndpointConfig>,
    pub upstream: Option<UpstreamConfig>,
}

#[derive(Debug, Clone)]
pub struct TunnelEndpointConfig {
    pub listen_addr: String,
    pub transport: TransportKind,
    pub quic: QuicServerConfig,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub server_addr: String,
    pub transport: TransportKind,
    pub token: String,
    pub dial_timeout: Duration,
    pub retry_interval: Duration,
    pub quic: QuicClientConfig,
}

#[derive(Debug, Clone, Default)]
pub struct QuicServerConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct QuicClientConfig {
    pub server_name: String,
    pub ca_file: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub listen_addr: String,
    pub peer: String,
    pub network: String,
    pub address: String,
    pub dial_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    peer_id: String,

    #[serde(default)]
    admin_addr: String,

    #[serde(default)]
    annotations: Annotations,

    logging: Option<FileLogging>,

    tunnel: Option<FileTunnel>,

    #[serde(default)]
    forwards: Vec<FileForward>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    auth_token: Option<String>,
    #[serde(default)]
    peer_tokens: HashMap<String, String>,
    handshake_timeout_ms: Option<i64>,
    keepalive_interval_ms: Option<i64>,
    refresh_interval_ms: Option<i64>,
    max_pending_opens: Option<i64>,
    endpoints: Option<Vec<FileTunnelEndpoint>>,
    upstream: Option<FileUpstream>,
}

#[derive(Debug, Deserialize)]
struct FileTunnelEndpoint {
    listen_addr: String,
    transport: Option<String>,
    quic: Option<FileQuicServer>,
}

#[derive(Debug, Deserialize)]
struct FileUpstream {
    server_addr: String,
    transport: Option<String>,
    token: Option<String>,
    dial_timeout_ms: Option<i64>,
    retry_interval_ms: Option<i64>,
    quic: Option<FileQuicClient>,
}

#[derive(Debug, Deserialize)]
struct FileQuicServer {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileQuicClient {
    server_name: Option<String>,
    ca_file: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
}

#[derive(Debug, Deserialize)]
struct FileForward {
    #[serde(default)]
    listen_addr: String,
    #[serde(default)]
    peer: String,
    #[serde(default)]
    address: String,
    network: Option<String>,
    dial_timeout_ms: Option<i64>,
}

fn trimmed(s: Option<&String>) -> String {
    s.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn millis(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => default,
    }
}

fn transport_of(v: Option<&String>, what: &str) -> anyhow::Result<TransportKind> {
    v.map(String::as_str)
        .unwrap_or("")
        .parse()
        .with_context(|| format!("config: {what}"))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            peer_id: fc.peer_id.trim().to_string(),
            admin_addr: fc.admin_addr.trim().to_string(),
            annotations: fc.annotations,
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            tunnel: TunnelConfig {
                auth_token: String::new(),
                peer_tokens: HashMap::new(),
                handshake_timeout: engine::DEFAULT_HANDSHAKE_TIMEOUT,
                keepalive_interval: Duration::from_secs(30),
                refresh_interval: Duration::ZERO,
                max_pending_opens: engine::DEFAULT_MAX_PENDING_OPENS,
                endpoints: vec![],
                upstream: None,
            },
            forwards: vec![],
        };

        if cfg.peer_id.is_empty() {
            cfg.peer_id = engine::random_peer_id("peer");
        }

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = l.level.as_ref().filter(|s| !s.trim().is_empty()) {
                cfg.logging.level = level.trim().to_string();
            }
            if let Some(fmt) = l.format.as_ref().filter(|s| !s.trim().is_empty()) {
                cfg.logging.format = fmt.trim().to_string();
            }
            if let Some(out) = l.output.as_ref().filter(|s| !s.trim().is_empty()) {
                cfg.logging.output = out.trim().to_string();
            }
            cfg.logging.add_source = l.add_source;
        }

        // --- Tunnel ---
        if let Some(t) = &fc.tunnel {
            let tc = &mut cfg.tunnel;
            tc.auth_token = trimmed(t.auth_token.as_ref());
            tc.peer_tokens = t
                .peer_tokens
                .iter()
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect();
            tc.handshake_timeout = millis(t.handshake_timeout_ms, tc.handshake_timeout);
            if tc.handshake_timeout.is_zero() {
                tc.handshake_timeout = engine::DEFAULT_HANDSHAKE_TIMEOUT;
            }
            tc.keepalive_interval = millis(t.keepalive_interval_ms, tc.keepalive_interval);
            tc.refresh_interval = millis(t.refresh_interval_ms, tc.refresh_interval);
            if let Some(n) = t.max_pending_opens {
                if n <= 0 {
                    anyhow::bail!("config: tunnel.max_pending_opens must be positive");
                }
                tc.max_pending_opens = n as usize;
            }

            for (i, ep) in t.endpoints.iter().flatten().enumerate() {
                let listen_addr = ep.listen_addr.trim().to_string();
                if listen_addr.is_empty() {
                    anyhow::bail!("config: tunnel.endpoints[{i}] missing listen_addr");
                }
                tc.endpoints.push(TunnelEndpointConfig {
                    listen_addr,
                    transport: transport_of(
                        ep.transport.as_ref(),
                        &format!("tunnel.endpoints[{i}].transport"),
                    )?,
                    quic: QuicServerConfig {
                        cert_file: trimmed(ep.quic.as_ref().and_then(|q| q.cert_file.as_ref())),
                        key_file: trimmed(ep.quic.as_ref().and_then(|q| q.key_file.as_ref())),
                    },
                });
            }

            if let Some(u) = &t.upstream {
                let server_addr = u.server_addr.trim().to_string();
                if server_addr.is_empty() {
                    anyhow::bail!("config: tunnel.upstream missing server_addr");
                }
                tc.upstream = Some(UpstreamConfig {
                    server_addr,
                    transport: transport_of(u.transport.as_ref(), "tunnel.upstream.transport")?,
                    token: trimmed(u.token.as_ref()),
                    dial_timeout: millis(u.dial_timeout_ms, Duration::from_secs(5)),
                    retry_interval: millis(u.retry_interval_ms, Duration::from_secs(10)),
                    quic: QuicClientConfig {
                        server_name: trimmed(u.quic.as_ref().and_then(|q| q.server_name.as_ref())),
                        ca_file: trimmed(u.quic.as_ref().and_then(|q| q.ca_file.as_ref())),
                        insecure_skip_verify: u
                            .quic
                            .as_ref()
                            .is_some_and(|q| q.insecure_skip_verify),
                    },
                });
            }
        }

        // --- Forwards ---
        for (i, f) in fc.forwards.iter().enumerate() {
            let fwd = ForwardConfig {
                listen_addr: f.listen_addr.trim().to_string(),
                peer: f.peer.trim().to_string(),
                network: f
                    .network
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("tcp")
                    .to_ascii_lowercase(),
                address: f.address.trim().to_string(),
                dial_timeout: millis(f.dial_timeout_ms, DEFAULT_DIAL_TIMEOUT),
            };
            for (field, value) in [
                ("listen_addr", &fwd.listen_addr),
                ("peer", &fwd.peer),
                ("address", &fwd.address),
            ] {
                if value.is_empty() {
                    anyhow::bail!("config: forwards[{i}] missing {field}");
                }
            }
            cfg.forwards.push(fwd);
        }

        if cfg.tunnel.endpoints.is_empty() && cfg.tunnel.upstream.is_none() {
            anyhow::bail!(
                "config: nothing to run (set tunnel.endpoints and/or tunnel.upstream)"
            );
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# edgetunnel configuration (auto-generated)
#
# This file was created because edgetunnel could not find a configuration file
# at the resolved config path.
#
# This default config is runnable without edits: the peer acts as a hub and
# waits for other peers to join on :7000. To join a hub instead, add a
# [tunnel.upstream] section with its server_addr.

peer_id = "hub"
admin_addr = ":8080"

[annotations]

[tunnel]
auth_token = ""
keepalive_interval_ms = 30000
refresh_interval_ms = 0

[[tunnel.endpoints]]
listen_addr = ":7000"
transport = "tcp" # tcp | quic

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# edgetunnel configuration (auto-generated)
#
# This file was created because edgetunnel could not find a configuration file
# at the resolved config path.
#
# This default config is runnable without edits: the peer acts as a hub and
# waits for other peers to join on :7000. To join a hub instead, add a
# tunnel.upstream section with its server_addr.

peer_id: "hub"
admin_addr: ":8080"

annotations: {}

tunnel:
  auth_token: ""
  keepalive_interval_ms: 30000
  refresh_interval_ms: 0
  endpoints:
    - listen_addr: ":7000"
      transport: "tcp" # tcp | quic

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
