use std::{net::SocketAddr, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[serde_with::serde_as]
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Address the proxy listens on for client connections.
    pub listen_address: SocketAddr,

    /// URL of a PAC script, fetched once at startup over a direct
    /// (non-proxied) connection. `http` scheme only.
    pub pac_url: Option<String>,

    /// A fixed upstream proxy as `host:port`, wrapped into a one-line
    /// constant PAC script. Ignored when `pac-url` is set.
    pub upstream_proxy: Option<String>,

    #[serde(default)]
    pub tcp_nodelay: bool,

    /// Deadline on every outbound TCP dial, in seconds. Unset means a
    /// dial can block indefinitely.
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    #[serde(default)]
    pub dial_timeout: Option<Duration>,

    /// Per-direction read idle deadline inside an established tunnel, in
    /// seconds. Unset means an idle tunnel stays open until either side
    /// closes.
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    #[serde(default)]
    pub idle_timeout: Option<Duration>,
}

pub fn load(path: &Path) -> anyhow::Result<Settings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("while reading config file {}", path.display()))?;
    toml::from_str(&contents).context("while parsing config file")
}
