//! kproxy: proxy checker
//!
//! Loads a proxy profile and checks it the same way the connection
//! manager does before bringing a tunnel up: reachability and external
//! IP through the proxy, then a timed download.
//!
//! ```text
//! kproxy <profile.toml> [check|ip|speed]
//! ```

use anyhow::{Context, Result, bail};
use kproxy_vpn::{ProxyConfiguration, Settings, build_client, check_reachability, measure_speed, parse_ip};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const USAGE: &str = "usage: kproxy <profile.toml> [check|ip|speed]";

/// Profile file: a `[proxy]` table plus optional `[settings.*]` tables
#[derive(Debug, Deserialize)]
struct Profile {
    proxy: ProxyConfiguration,
    #[serde(default)]
    settings: Settings,
}

impl Profile {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let profile: Profile = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        profile.proxy.validate()?;
        profile.settings.validate()?;
        Ok(profile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Check,
    Ip,
    Speed,
}

impl std::str::FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "check" => Ok(Command::Check),
            "ip" => Ok(Command::Ip),
            "speed" => Ok(Command::Speed),
            other => bail!("unknown command: {other}\n{USAGE}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (RUST_LOG overrides the default level)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().context(USAGE)?;
    let command: Command = args.next().as_deref().unwrap_or("check").parse()?;

    let profile = Profile::load(Path::new(&path))?;
    info!("kproxy checking {}", profile.proxy);

    let client = build_client(&profile.proxy, &profile.settings)?;
    let endpoints = &profile.settings.endpoints;
    let result = run(command, &client, &endpoints.ip_check_url, &endpoints.speed_test_url).await;
    client.close().await;

    let (requests, failures, bytes) = client.stats();
    info!("{} requests, {} failed, {} bytes downloaded", requests, failures, bytes);
    result
}

async fn run(command: Command, client: &kproxy_net::ProxyClient, ip_url: &str, speed_url: &str) -> Result<()> {
    if matches!(command, Command::Check | Command::Ip) {
        let body = check_reachability(client, ip_url).await?;
        match parse_ip(&body) {
            Some(ip) => println!("ip: {}", ip),
            None => {
                warn!("IP-check body is not an address");
                println!("ip: {}", body.trim());
            }
        }
    }

    if matches!(command, Command::Check | Command::Speed) {
        let speed = measure_speed(client, speed_url).await?;
        println!("speed: {}", speed);
    }

    Ok(())
}
