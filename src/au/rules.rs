//! Crawl rules: the ordered regex predicate deciding which URLs belong to an AU

use regex::Regex;
use serde::Deserialize;

/// How a rule turns a pattern match into a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    /// Include if the pattern matches
    Include,
    /// Exclude if the pattern matches
    Exclude,
    /// Include if the pattern does not match
    NoMatchInclude,
    /// Exclude if the pattern does not match
    NoMatchExclude,
    /// Include if the pattern matches, otherwise exclude
    IncludeElseExclude,
    /// Exclude if the pattern matches, otherwise include
    ExcludeElseInclude,
}

/// Outcome of evaluating one rule against a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMatch {
    Include,
    Exclude,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct CrawlRule {
    regex: Regex,
    action: RuleAction,
}

impl CrawlRule {
    pub fn new(pattern: &str, action: RuleAction) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            action,
        })
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn evaluate(&self, url: &str) -> RuleMatch {
        let matched = self.regex.is_match(url);
        match (self.action, matched) {
            (RuleAction::Include, true) => RuleMatch::Include,
            (RuleAction::Exclude, true) => RuleMatch::Exclude,
            (RuleAction::NoMatchInclude, false) => RuleMatch::Include,
            (RuleAction::NoMatchExclude, false) => RuleMatch::Exclude,
            (RuleAction::IncludeElseExclude, m) => {
                if m {
                    RuleMatch::Include
                } else {
                    RuleMatch::Exclude
                }
            }
            (RuleAction::ExcludeElseInclude, m) => {
                if m {
                    RuleMatch::Exclude
                } else {
                    RuleMatch::Include
                }
            }
            _ => RuleMatch::Ignore,
        }
    }
}

/// Ordered rule list; the first rule that does not ignore a URL decides it,
/// and a URL no rule decides is excluded
#[derive(Debug, Clone, Default)]
pub struct CrawlRules {
    rules: Vec<CrawlRule>,
}

impl CrawlRules {
    pub fn new(rules: Vec<CrawlRule>) -> Self {
        Self { rules }
    }

    /// Rules including everything under the given URL prefixes
    pub fn prefixes<S: AsRef<str>>(prefixes: &[S]) -> Result<Self, regex::Error> {
        let rules = prefixes
            .iter()
            .map(|p| CrawlRule::new(&format!("^{}", regex::escape(p.as_ref())), RuleAction::Include))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_included(&self, url: &str) -> bool {
        self.rules
            .iter()
            .map(|rule| rule.evaluate(url))
            .find(|m| *m != RuleMatch::Ignore)
            .map(|m| m == RuleMatch::Include)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions() {
        let url = "http://pub.example/a.html";
        let hit = "pub\\.example";
        let miss = "other\\.example";

        let eval = |p: &str, a| CrawlRule::new(p, a).unwrap().evaluate(url);

        assert_eq!(eval(hit, RuleAction::Include), RuleMatch::Include);
        assert_eq!(eval(miss, RuleAction::Include), RuleMatch::Ignore);
        assert_eq!(eval(hit, RuleAction::Exclude), RuleMatch::Exclude);
        assert_eq!(eval(miss, RuleAction::NoMatchInclude), RuleMatch::Include);
        assert_eq!(eval(hit, RuleAction::NoMatchExclude), RuleMatch::Ignore);
        assert_eq!(eval(miss, RuleAction::IncludeElseExclude), RuleMatch::Exclude);
        assert_eq!(eval(miss, RuleAction::ExcludeElseInclude), RuleMatch::Include);
    }

    #[test]
    fn test_first_decisive_rule_wins() {
        let rules = CrawlRules::new(vec![
            CrawlRule::new(r"\.css$", RuleAction::Exclude).unwrap(),
            CrawlRule::new(r"^http://pub\.example/", RuleAction::Include).unwrap(),
        ]);
        assert!(rules.is_included("http://pub.example/index.html"));
        assert!(!rules.is_included("http://pub.example/style.css"));
        assert!(!rules.is_included("http://other.example/index.html"));
    }

    #[test]
    fn test_prefix_rules_escape_metacharacters() {
        let rules = CrawlRules::prefixes(&["http://pub.example/j?x=1"]).unwrap();
        assert!(rules.is_included("http://pub.example/j?x=1&page=2"));
        assert!(!rules.is_included("http://pubXexample/j?x=1"));
    }

    #[test]
    fn test_empty_rules_exclude_everything() {
        assert!(!CrawlRules::default().is_included("http://pub.example/"));
    }
}
