use anyhow::{Context, Result, bail};
use regex::{Regex, RegexBuilder};
use trust_dns_proto::rr::Name;

use crate::{
    mapping::{MappingMatcher, MappingRule, MappingTable},
    wildcard::WildcardMatcher,
};

pub(crate) const ADDRESS_GROUP: &str = "ipaddr";

pub struct CompiledPatterns {
    pub wildcard: Option<WildcardMatcher>,
    pub mapping: Option<MappingMatcher>,
}

pub fn compile(wildcard_domain: Option<&str>, rules: &[MappingRule]) -> Result<CompiledPatterns> {
    let wildcard = match wildcard_domain.map(normalize_name) {
        Some(domain) if !domain.is_empty() => Some(compile_wildcard(domain)?),
        _ => None,
    };

    let mapping = if rules.is_empty() {
        None
    } else {
        Some(compile_mapping(rules)?)
    };

    Ok(CompiledPatterns { wildcard, mapping })
}

/// Lowercases `name` and drops a trailing root dot.
pub fn normalize_name(name: &str) -> String {
    let mut lc = name.to_ascii_lowercase();

    if lc.ends_with('.') {
        lc.pop();
    }

    lc
}

fn compile_wildcard(domain: String) -> Result<WildcardMatcher> {
    if domain.split('.').any(str::is_empty) {
        bail!("wildcard domain {:?} has an empty label", domain);
    }
    Name::from_ascii(&domain).with_context(|| format!("invalid wildcard domain {:?}", domain))?;

    let pattern = format!(
        r"^(?:.*\.)?(?P<{}>[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+)\.{}",
        ADDRESS_GROUP,
        regex::escape(&domain)
    );

    log::debug!("wildcard {}", pattern);

    let regex = build(&pattern).with_context(|| format!("compiling wildcard domain {:?}", domain))?;

    Ok(WildcardMatcher::new(domain, regex))
}

fn compile_mapping(rules: &[MappingRule]) -> Result<MappingMatcher> {
    // literal names always beat globs, whatever order the file lists them in
    let (exact, globs): (Vec<&MappingRule>, Vec<&MappingRule>) =
        rules.iter().partition(|rule| !rule.is_glob());

    let mut table = MappingTable::default();
    let mut alternatives = Vec::with_capacity(rules.len());

    for rule in exact.into_iter().chain(globs) {
        let pattern = normalize_name(rule.pattern.trim());
        let target = rule.target.trim();

        if pattern.is_empty() {
            bail!("mapping rule with empty pattern (target {:?})", rule.target);
        }
        if target.is_empty() {
            bail!("mapping rule {:?} has an empty target", rule.pattern);
        }

        let label = table.push(MappingRule::new(pattern.clone(), target)).to_owned();
        alternatives.push(format!("(?P<{}>{})", label, glob_to_regex(&pattern)));
    }

    let pattern = format!("^(?:{})$", alternatives.join("|"));

    log::debug!("mapping {}", pattern);
    log::debug!("results {:?}", table.list());

    let regex = build(&pattern).context("compiling mapping rules")?;

    Ok(MappingMatcher::new(regex, table))
}

fn glob_to_regex(glob: &str) -> String {
    regex::escape(glob).replace(r"\*", ".*")
}

fn build(pattern: &str) -> Result<Regex> {
    Ok(RegexBuilder::new(pattern).case_insensitive(true).build()?)
}
