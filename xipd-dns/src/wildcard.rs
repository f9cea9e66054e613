use regex::Regex;

use crate::pattern::ADDRESS_GROUP;

/// Matches `<anything>.<a.b.c.d>.<domain>` style names.
///
/// The pattern is anchored at the start of the name only, so text following
/// the domain suffix does not prevent a match: `www.10.0.0.1.xip.io.evil.com`
/// still yields `10.0.0.1`.
pub struct WildcardMatcher {
    domain: String,
    regex: Regex,
}

impl WildcardMatcher {
    pub(crate) fn new(domain: String, regex: Regex) -> Self {
        Self { domain, regex }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Returns the embedded address exactly as written in `name`. Octets are
    /// not range checked.
    pub fn lookup<'n>(&self, name: &'n str) -> Option<&'n str> {
        self.regex
            .captures(name)
            .and_then(|caps| caps.name(ADDRESS_GROUP))
            .map(|m| m.as_str())
    }
}
