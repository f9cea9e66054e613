use std::collections::HashSet;

use anyhow::Result;
use trust_dns_proto::rr::RecordType;

use crate::{
    mapping::{MappingMatcher, MappingRule},
    pattern::{self, CompiledPatterns, normalize_name},
    wildcard::WildcardMatcher,
};

/// Upper bound on how many non-address targets are followed for one query.
pub const MAX_INDIRECTIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: String,
    pub record_type: RecordType,
}

impl Query {
    pub fn new(name: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            name: name.into(),
            record_type,
        }
    }

    pub fn address(name: impl Into<String>) -> Self {
        Self::new(name, RecordType::A)
    }

    pub fn is_address(&self) -> bool {
        self.record_type == RecordType::A
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Answer locally with this address, bound to the queried name.
    LiteralAddress(String),
    /// Local rules ended on a hostname; resolve it upstream.
    IndirectName(String),
    /// Not ours; delegate the original query upstream.
    NoMatch,
}

/// Decides between answering locally and delegating upstream.
///
/// Holds only the compiled matchers, which are never mutated after
/// construction, so one engine can be shared by any number of concurrent
/// queries behind an `Arc`.
pub struct ResolutionEngine {
    wildcard: Option<WildcardMatcher>,
    mapping: Option<MappingMatcher>,
    max_indirections: usize,
}

impl ResolutionEngine {
    pub fn new(patterns: CompiledPatterns) -> Self {
        Self {
            wildcard: patterns.wildcard,
            mapping: patterns.mapping,
            max_indirections: MAX_INDIRECTIONS,
        }
    }

    pub fn from_config(wildcard_domain: Option<&str>, rules: &[MappingRule]) -> Result<Self> {
        Ok(Self::new(pattern::compile(wildcard_domain, rules)?))
    }

    pub fn with_max_indirections(mut self, max: usize) -> Self {
        self.max_indirections = max;
        self
    }

    pub fn wildcard(&self) -> Option<&WildcardMatcher> {
        self.wildcard.as_ref()
    }

    pub fn mapping(&self) -> Option<&MappingMatcher> {
        self.mapping.as_ref()
    }

    pub fn resolve(&self, query: &Query) -> ResolutionOutcome {
        log::trace!("address {} {:?}", query.name, query.record_type);

        if !query.is_address() {
            return ResolutionOutcome::NoMatch;
        }

        let Some(mut candidate) = self.local_lookup(&query.name) else {
            log::trace!("fallback {}", query.name);
            return ResolutionOutcome::NoMatch;
        };

        let mut visited = HashSet::new();

        while !is_address_literal(&candidate) {
            if visited.len() >= self.max_indirections || !visited.insert(normalize_name(&candidate)) {
                log::warn!(
                    "giving up on {} after {} indirections (at {})",
                    query.name,
                    visited.len(),
                    candidate
                );
                return ResolutionOutcome::NoMatch;
            }

            match self.local_lookup(&candidate) {
                Some(next) => candidate = next,
                None => {
                    log::debug!("cname {} -> {}", query.name, candidate);
                    return ResolutionOutcome::IndirectName(candidate);
                }
            }
        }

        ResolutionOutcome::LiteralAddress(candidate)
    }

    fn local_lookup(&self, name: &str) -> Option<String> {
        let name = normalize_name(name);

        log::trace!("lookup {}", name);

        if let Some(ipaddr) = self.wildcard.as_ref().and_then(|w| w.lookup(&name)) {
            log::debug!("wildcard {} --> {}", name, ipaddr);
            return Some(ipaddr.to_string());
        }

        let result = self.mapping.as_ref()?.lookup(&name)?;
        log::debug!("mapping {} --> {}", name, result);

        Some(result.to_string())
    }
}

/// Targets starting with a decimal digit are taken as IPv4 literals.
fn is_address_literal(candidate: &str) -> bool {
    candidate.starts_with(|c: char| c.is_ascii_digit())
}
