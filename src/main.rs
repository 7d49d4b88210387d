use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod policy;
mod proxy;

use policy::{ConstantScriptResolver, PolicyResolver};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./config.toml"));
    let settings: Arc<config::Settings> = Arc::new(config::load(&config_path)?);

    let script = if let Some(ref url) = settings.pac_url {
        info!("fetching PAC script from {url}");
        policy::fetch_script(url).await?
    } else if let Some(ref proxy) = settings.upstream_proxy {
        policy::hardcoded_proxy_script(proxy)
    } else {
        String::from(r#"function FindProxyForURL(url, host) { return "DIRECT" }"#)
    };
    let resolver: Arc<dyn PolicyResolver> = Arc::new(
        ConstantScriptResolver::from_script(&script).context("while loading the PAC script")?,
    );

    let listener = TcpListener::bind(settings.listen_address)
        .await
        .with_context(|| format!("while binding to {}", settings.listen_address))?;
    info!("listening on {}", settings.listen_address);

    proxy::start(settings, resolver, listener).await?;

    info!("exiting");

    Ok(())
}
