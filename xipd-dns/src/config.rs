use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{engine::ResolutionEngine, mapping::MappingRule};

pub const DEFAULT_WILDCARD_DOMAIN: &str = "xip.io";
pub const DEFAULT_NAME_SERVERS: &str = "8.8.8.8,8.8.4.4";
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";
pub const DNS_PORT: u16 = 53;

/// Everything the engine and its upstream chain need, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub wildcard_domain: Option<String>,
    pub mapping: Vec<MappingRule>,
    pub name_servers: Vec<SocketAddr>,
    pub debug_level: u8,
}

impl EngineConfig {
    pub fn build_engine(&self) -> Result<ResolutionEngine> {
        log::debug!("nameservers {:?}", self.name_servers);

        ResolutionEngine::from_config(self.wildcard_domain.as_deref(), &self.mapping)
    }

    /// Maps the numeric `DEBUG_LEVEL` onto a log filter.
    pub fn log_level(&self) -> log::LevelFilter {
        match self.debug_level {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MappingSource {
    Rules(Vec<MappingRule>),
    Object(Map<String, Value>),
}

/// Parses a mapping file. Either a JSON object of `pattern: target` pairs,
/// kept in file order, or an array of `{"pattern": .., "target": ..}`.
pub fn parse_mapping(text: &str) -> Result<Vec<MappingRule>> {
    let source: MappingSource =
        serde_json::from_str(text).context("mapping must be a JSON object or an array of rules")?;

    match source {
        MappingSource::Rules(rules) => Ok(rules),
        MappingSource::Object(map) => map
            .into_iter()
            .map(|(pattern, target)| match target {
                Value::String(target) => Ok(MappingRule::new(pattern, target)),
                other => bail!("target of {:?} must be a string, got {}", pattern, other),
            })
            .collect(),
    }
}

pub fn load_mapping_file(path: &Path) -> Result<Vec<MappingRule>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading mapping file {}", path.display()))?;

    parse_mapping(&text).with_context(|| format!("parsing mapping file {}", path.display()))
}

/// Parses `8.8.8.8, 1.1.1.1:5353, [::1]:53` style lists.
pub fn parse_name_servers(list: &str) -> Result<Vec<SocketAddr>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_name_server)
        .collect()
}

fn parse_name_server(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let ip: IpAddr = s
        .parse()
        .with_context(|| format!("invalid name server address {:?}", s))?;

    Ok(SocketAddr::new(ip, DNS_PORT))
}

/// Collects `nameserver` entries from resolv.conf text. Unparsable entries
/// are skipped.
pub fn parse_resolv_conf(text: &str) -> Vec<SocketAddr> {
    text.lines()
        .map(|line| line.split(['#', ';']).next().unwrap_or_default())
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("nameserver"), Some(addr)) => addr.parse::<IpAddr>().ok(),
                _ => None,
            }
        })
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .collect()
}

/// An explicit list wins; otherwise resolv.conf; otherwise public resolvers.
pub fn resolve_name_servers(explicit: Option<&str>, resolv_conf: &Path) -> Result<Vec<SocketAddr>> {
    if let Some(list) = explicit.filter(|l| !l.trim().is_empty()) {
        let servers = parse_name_servers(list)?;
        if servers.is_empty() {
            bail!("no name servers in {:?}", list);
        }
        return Ok(servers);
    }

    match fs::read_to_string(resolv_conf) {
        Ok(text) => {
            let servers = parse_resolv_conf(&text);
            if !servers.is_empty() {
                return Ok(servers);
            }
            log::warn!("no usable nameserver in {}", resolv_conf.display());
        }
        Err(e) => log::warn!("cannot read {}: {}", resolv_conf.display(), e),
    }

    parse_name_servers(DEFAULT_NAME_SERVERS)
}
