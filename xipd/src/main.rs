use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use clap::Parser;
use xipd_dns::{
    DynamicResolver, EngineConfig, NameServerChain, WildcardMatcher,
    config::{self, DEFAULT_RESOLV_CONF, DEFAULT_WILDCARD_DOMAIN},
    run_server,
};

/// DNS server answering xip.io style wildcard names and glob-mapped hosts
/// locally, forwarding everything else.
#[derive(Parser, Debug)]
#[command(name = "xipd", version)]
struct Args {
    /// Domain whose subdomains embed an IPv4 address; empty disables it
    #[arg(long, env = "WILDCARD_DOMAIN", default_value = DEFAULT_WILDCARD_DOMAIN)]
    wildcard_domain: String,

    /// JSON file mapping glob patterns to addresses or hostnames
    #[arg(long, env = "MAPPED_HOSTS")]
    mapped_hosts: Option<PathBuf>,

    /// Alternative name for --mapped-hosts
    #[arg(long, env = "MAPPING_JSON", conflicts_with = "mapped_hosts")]
    mapping_json: Option<PathBuf>,

    /// Comma separated upstream servers, `ip` or `ip:port`
    #[arg(long, env = "NAME_SERVERS")]
    name_servers: Option<String>,

    /// resolv.conf used when no name servers are given
    #[arg(long, env = "RESOLV_CONF", default_value = DEFAULT_RESOLV_CONF)]
    resolv_conf: PathBuf,

    /// 0 info, 1 debug, 2 and above trace
    #[arg(long, env = "DEBUG_LEVEL", default_value_t = 0)]
    debug_level: u8,

    #[arg(long, env = "LISTEN_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    listen_address: IpAddr,

    #[arg(long, env = "LISTEN_PORT", default_value_t = config::DNS_PORT)]
    port: u16,

    /// Seconds to wait for each upstream server
    #[arg(long, env = "UPSTREAM_TIMEOUT", default_value_t = 2)]
    upstream_timeout: u64,
}

impl Args {
    /// Settings available before anything is read from disk.
    fn base_config(&self) -> EngineConfig {
        EngineConfig {
            wildcard_domain: Some(self.wildcard_domain.clone()).filter(|d| !d.trim().is_empty()),
            debug_level: self.debug_level,
            ..Default::default()
        }
    }

    fn engine_config(&self) -> Result<EngineConfig> {
        let mapping = match self.mapped_hosts.as_ref().or(self.mapping_json.as_ref()) {
            Some(path) => config::load_mapping_file(path)?,
            None => Vec::new(),
        };

        Ok(EngineConfig {
            mapping,
            name_servers: config::resolve_name_servers(self.name_servers.as_deref(), &self.resolv_conf)?,
            ..self.base_config()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.base_config().log_level())
        .parse_default_env()
        .init();

    let config = args.engine_config()?;
    let engine = config.build_engine()?;

    log::info!(
        "wildcard domain {:?}, mapping {:?}, upstream {:?}",
        engine.wildcard().map(WildcardMatcher::domain),
        engine.mapping().map(|m| m.table().list()).unwrap_or_default(),
        config.name_servers
    );

    let timeout = Duration::from_secs(args.upstream_timeout);
    let upstream = NameServerChain::new(config.name_servers.clone()).with_timeout(timeout);
    let resolver = DynamicResolver::new(engine, Arc::new(upstream));

    let handle = run_server(SocketAddr::new(args.listen_address, args.port), resolver).await?;

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;

    Ok(())
}
