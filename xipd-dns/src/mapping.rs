use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MappingRule {
    pub pattern: String,
    pub target: String,
}

impl MappingRule {
    pub fn new(pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            target: target.into(),
        }
    }

    pub fn is_glob(&self) -> bool {
        self.pattern.contains('*')
    }
}

/// Compiled rules in precedence order, each tagged with the label of its
/// capture group in the combined pattern.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    entries: Vec<(String, MappingRule)>,
}

impl MappingTable {
    pub(crate) fn push(&mut self, rule: MappingRule) -> &str {
        let label = format!("RULE{}", self.entries.len() + 1);
        self.entries.push((label, rule));

        &self.entries[self.entries.len() - 1].0
    }

    pub fn target(&self, label: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, rule)| rule.target.as_str())
    }

    pub fn list(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(_, rule)| (rule.pattern.clone(), rule.target.clone()))
            .collect()
    }

    fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(label, _)| label.as_str())
    }
}

pub struct MappingMatcher {
    regex: Regex,
    table: MappingTable,
}

impl MappingMatcher {
    pub(crate) fn new(regex: Regex, table: MappingTable) -> Self {
        Self { regex, table }
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    /// Returns the target of the first rule matching the whole of `name`.
    /// `name` is expected to be normalized already.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        let caps = self.regex.captures(name)?;

        let label = self.table.labels().find(|l| caps.name(l).is_some())?;

        self.table.target(label)
    }
}
