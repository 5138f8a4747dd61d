//! Patch/unpatch pattern lists: `[!]name-pattern[@module-pattern]`, glob by
//! default, full regex under an explicit `regex:` prefix or whenever the
//! name half contains a character only regex syntax uses (`^`, `$`, `+`,
//! parens, `|`, `\`, braces), last match in the list wins, and a list made
//! up entirely of negated patterns is treated as "everything except
//! these" rather than "nothing".

use regex::Regex;
use thiserror::Error;

/// A single compiled pattern entry.
#[derive(Debug)]
struct Pattern {
    negated: bool,
    name: NameMatcher,
    module: Option<glob::Pattern>,
}

#[derive(Debug)]
enum NameMatcher {
    Glob(glob::Pattern),
    Regex(Regex),
}

impl NameMatcher {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatcher::Glob(g) => g.matches(name),
            NameMatcher::Regex(r) => r.is_match(name),
        }
    }
}

/// Characters that only mean something in regex syntax, never in a glob
/// pattern (`*`, `?`, and `[...]` are shared by both and stay glob by
/// default). A name pattern containing one of these is auto-detected as a
/// regex even without the explicit `regex:` prefix, matching the uftrace
/// pattern semantics this module distills (spec.md §8 scenario 4:
/// `"!^a"` must exclude names starting with `a`, not match the literal
/// string `^a`).
const REGEX_ONLY_METACHARS: [char; 8] = ['^', '$', '+', '(', ')', '|', '\\', '{'];

fn looks_like_regex(name_pattern: &str) -> bool {
    name_pattern.contains(&REGEX_ONLY_METACHARS[..])
}

/// A pattern string could not be compiled.
#[derive(Debug, Error)]
pub enum PatternError {
    /// The glob half of the pattern (name or module qualifier) was invalid.
    #[error("invalid glob pattern {0:?}: {1}")]
    Glob(String, glob::PatternError),
    /// The `regex:`-prefixed half of the pattern was invalid.
    #[error("invalid regex pattern {0:?}: {1}")]
    Regex(String, regex::Error),
}

impl Pattern {
    fn parse(spec: &str) -> Result<Self, PatternError> {
        let (negated, rest) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };

        let (name_part, module_part) = match rest.split_once('@') {
            Some((n, m)) => (n, Some(m)),
            None => (rest, None),
        };

        let name = if let Some(re) = name_part.strip_prefix("regex:") {
            NameMatcher::Regex(
                Regex::new(&format!("^(?:{re})$"))
                    .map_err(|e| PatternError::Regex(re.to_string(), e))?,
            )
        } else if looks_like_regex(name_part) {
            // Auto-detected, not explicitly prefixed: used as given, not
            // wrapped in an implicit `^(?:...)$` anchor, since a pattern
            // like `^a` already carries the anchor it needs and wrapping
            // it again would just be redundant.
            NameMatcher::Regex(
                Regex::new(name_part).map_err(|e| PatternError::Regex(name_part.to_string(), e))?,
            )
        } else {
            NameMatcher::Glob(
                glob::Pattern::new(name_part)
                    .map_err(|e| PatternError::Glob(name_part.to_string(), e))?,
            )
        };

        let module = module_part
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| PatternError::Glob(module_part.unwrap_or_default().to_string(), e))?;

        Ok(Pattern { negated, name, module })
    }

    fn matches_module(&self, module: &str) -> bool {
        match &self.module {
            None => true,
            Some(g) => g.matches(module),
        }
    }

    fn matches_name(&self, name: &str) -> bool {
        self.name.matches(name)
    }
}

/// An ordered list of compiled patterns with last-match-wins semantics.
///
/// If every pattern supplied by the caller is negated, a synthetic `*`
/// match-all is prepended first so the negated patterns act as
/// exceptions carved out of "match everything" rather than a no-op list
/// that matches nothing.
#[derive(Debug)]
pub struct PatternList {
    patterns: Vec<Pattern>,
}

impl PatternList {
    /// Compiles a pattern list from its string form.
    pub fn build(specs: &[&str]) -> Result<Self, PatternError> {
        let mut parsed = Vec::with_capacity(specs.len());
        for spec in specs {
            parsed.push(Pattern::parse(spec)?);
        }

        let all_negative = !parsed.is_empty() && parsed.iter().all(|p| p.negated);
        if all_negative {
            parsed.insert(
                0,
                Pattern { negated: false, name: NameMatcher::Glob(glob::Pattern::new("*").unwrap()), module: None },
            );
        }

        Ok(PatternList { patterns: parsed })
    }

    /// An empty pattern list, matching nothing.
    pub fn empty() -> Self {
        PatternList { patterns: Vec::new() }
    }

    /// Whether `name` in `module` is selected by this list, applying
    /// last-match-wins across the full pattern sequence.
    pub fn matches(&self, name: &str, module: &str) -> bool {
        let mut result = false;
        for p in &self.patterns {
            if p.matches_module(module) && p.matches_name(name) {
                result = !p.negated;
            }
        }
        result
    }

    /// Whether any pattern in the list could possibly match something in
    /// `module`, checking only the module qualifier. Used to skip
    /// per-symbol matching entirely for modules no pattern even mentions.
    pub fn module_could_match(&self, module: &str) -> bool {
        self.patterns.iter().any(|p| p.matches_module(module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_glob_matches_by_name_only() {
        let list = PatternList::build(&["foo*"]).unwrap();
        assert!(list.matches("foobar", "a.out"));
        assert!(!list.matches("barfoo", "a.out"));
    }

    #[test]
    fn module_qualifier_restricts_matching() {
        let list = PatternList::build(&["foo@libc.so*"]).unwrap();
        assert!(list.matches("foo", "libc.so.6"));
        assert!(!list.matches("foo", "a.out"));
    }

    #[test]
    fn last_match_wins_across_exceptions() {
        let list = PatternList::build(&["foo*", "!foobar"]).unwrap();
        assert!(list.matches("foobaz", "a.out"));
        assert!(!list.matches("foobar", "a.out"));
    }

    #[test]
    fn all_negative_list_means_match_everything_except() {
        let list = PatternList::build(&["!foobar"]).unwrap();
        assert!(list.matches("foobaz", "a.out"));
        assert!(!list.matches("foobar", "a.out"));
    }

    #[test]
    fn empty_list_matches_nothing() {
        let list = PatternList::empty();
        assert!(!list.matches("anything", "a.out"));
    }

    #[test]
    fn regex_prefix_uses_full_regex_matching() {
        let list = PatternList::build(&["regex:^foo[0-9]+$"]).unwrap();
        assert!(list.matches("foo42", "a.out"));
        assert!(!list.matches("foo", "a.out"));
        assert!(!list.matches("xfoo42", "a.out"));
    }

    #[test]
    fn caret_prefixed_negative_pattern_auto_detects_as_regex() {
        // spec.md §8 scenario 4: `"!^a"` must exclude names beginning
        // with `a` as a regex, not match the literal glob string `^a`.
        let list = PatternList::build(&["!^a"]).unwrap();
        assert!(!list.matches("abc", "a.out"));
        assert!(list.matches("xyz", "a.out"));
    }

    #[test]
    fn regex_metachars_are_detected_without_the_explicit_prefix() {
        let list = PatternList::build(&["foo(bar|baz)"]).unwrap();
        assert!(list.matches("foobar", "a.out"));
        assert!(list.matches("foobaz", "a.out"));
        assert!(!list.matches("fooqux", "a.out"));
    }

    #[test]
    fn plain_glob_wildcards_are_not_mistaken_for_regex() {
        let list = PatternList::build(&["foo*[0-9]"]).unwrap();
        assert!(list.matches("foobar5", "a.out"));
        assert!(!list.matches("foobarx", "a.out"));
    }

    #[test]
    fn module_could_match_checks_qualifier_only() {
        let list = PatternList::build(&["foo@libc.so*"]).unwrap();
        assert!(list.module_could_match("libc.so.6"));
        assert!(!list.module_could_match("a.out"));

        let unconstrained = PatternList::build(&["foo"]).unwrap();
        assert!(unconstrained.module_could_match("anything"));
    }
}
