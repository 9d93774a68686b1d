use crate::cache::lru::ShardedLru;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::collections::HashMap;
use std::sync::Arc;

fn normalize(name: &str) -> String {
    let trimmed = name.trim_end_matches('.');
    trimmed.to_ascii_lowercase()
}

/// Exact-match domain set.
#[derive(Debug, Default, Clone)]
pub struct FullMatcher {
    set: FxHashMap<String, ()>,
}

impl FullMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pattern: &str) {
        self.set.insert(normalize(pattern), ());
    }

    pub fn matches(&self, qname: &str) -> bool {
        self.set.contains_key(&normalize(qname))
    }
}

/// Reverse-label suffix trie, e.g. "a.b.example.com" matches a pattern
/// "example.com" stored as the reversed label chain com -> example.
#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    terminal: bool,
}

#[derive(Debug, Default, Clone)]
pub struct SuffixTrie {
    root: Arc<TrieNodeInner>,
}

#[derive(Debug, Default)]
struct TrieNodeInner {
    node: std::sync::Mutex<TrieNode>,
}

impl SuffixTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pattern: &str) {
        let normalized = normalize(pattern);
        let labels: Vec<&str> = normalized.split('.').rev().filter(|s| !s.is_empty()).collect();
        let mut guard = self.root.node.lock().unwrap();
        let mut cur = &mut *guard;
        for label in labels {
            cur = cur.children.entry(label.to_string()).or_default();
        }
        cur.terminal = true;
        // Collapse redundant descendants: once a node is terminal, suffix
        // matching for anything below it is implied, so drop its subtree.
        cur.children.clear();
    }

    pub fn matches(&self, qname: &str) -> bool {
        let normalized = normalize(qname);
        let labels: Vec<&str> = normalized.split('.').rev().filter(|s| !s.is_empty()).collect();
        let guard = self.root.node.lock().unwrap();
        let mut cur = &*guard;
        for label in labels {
            match cur.children.get(label) {
                Some(next) => {
                    if next.terminal {
                        return true;
                    }
                    cur = next;
                }
                None => return false,
            }
        }
        false
    }
}

/// Linear substring scan over a keyword set.
#[derive(Debug, Default, Clone)]
pub struct KeywordMatcher {
    keywords: Vec<String>,
}

impl KeywordMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keyword: &str) {
        self.keywords.push(normalize(keyword));
    }

    pub fn matches(&self, qname: &str) -> bool {
        let normalized = normalize(qname);
        self.keywords.iter().any(|k| normalized.contains(k.as_str()))
    }
}

/// Compiled regex set with a capped result cache.
pub struct RegexMatcher {
    patterns: Vec<Regex>,
    result_cache: Option<ShardedLru<bool>>,
}

impl std::fmt::Debug for RegexMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegexMatcher")
            .field("patterns", &self.patterns.len())
            .finish()
    }
}

impl RegexMatcher {
    pub fn new(cache_capacity: Option<usize>) -> Self {
        Self {
            patterns: Vec::new(),
            result_cache: cache_capacity.map(|cap| ShardedLru::new(cap, 8)),
        }
    }

    pub fn insert(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.patterns.push(Regex::new(pattern)?);
        Ok(())
    }

    pub fn matches(&self, qname: &str) -> bool {
        if let Some(cache) = &self.result_cache {
            if let Some(hit) = cache.get(qname) {
                return hit;
            }
        }
        let result = self.patterns.iter().any(|r| r.is_match(qname));
        if let Some(cache) = &self.result_cache {
            cache.insert(qname.to_string(), result);
        }
        result
    }
}

/// Composite matcher evaluating in the fixed order: full, domain suffix,
/// keyword, regex. Any hit short-circuits.
#[derive(Debug, Default)]
pub struct DomainMixer {
    pub full: FullMatcher,
    pub suffix: SuffixTrie,
    pub keyword: KeywordMatcher,
    pub regex: Option<RegexMatcher>,
}

impl DomainMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads one pattern, dispatching on its `full:`/`domain:`/`keyword:`/
    /// `regexp:` prefix (bare patterns default to domain-suffix, matching
    /// the convention used by text pattern list formats).
    pub fn push_pattern(&mut self, pattern: &str) -> anyhow::Result<()> {
        if let Some(rest) = pattern.strip_prefix("full:") {
            self.full.insert(rest);
        } else if let Some(rest) = pattern.strip_prefix("domain:") {
            self.suffix.insert(rest);
        } else if let Some(rest) = pattern.strip_prefix("keyword:") {
            self.keyword.insert(rest);
        } else if let Some(rest) = pattern.strip_prefix("regexp:") {
            self.regex
                .get_or_insert_with(|| RegexMatcher::new(Some(4096)))
                .insert(rest)?;
        } else {
            self.suffix.insert(pattern);
        }
        Ok(())
    }

    pub fn matches(&self, qname: &str) -> bool {
        if self.full.matches(qname) {
            return true;
        }
        if self.suffix.matches(qname) {
            return true;
        }
        if self.keyword.matches(qname) {
            return true;
        }
        if let Some(regex) = &self.regex {
            if regex.matches(qname) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_matcher_is_exact() {
        let mut m = FullMatcher::new();
        m.insert("example.com");
        assert!(m.matches("example.com"));
        assert!(m.matches("EXAMPLE.COM."));
        assert!(!m.matches("sub.example.com"));
    }

    #[test]
    fn suffix_trie_matches_subdomains() {
        let trie = SuffixTrie::new();
        trie.insert("example.com");
        assert!(trie.matches("a.b.example.com"));
        assert!(trie.matches("example.com"));
        assert!(!trie.matches("notexample.com"));
    }

    #[test]
    fn suffix_trie_collapses_redundant_descendants() {
        let trie = SuffixTrie::new();
        trie.insert("example.com");
        trie.insert("sub.example.com"); // redundant, already covered
        assert!(trie.matches("sub.example.com"));
        assert!(trie.matches("other.example.com"));
    }

    #[test]
    fn keyword_matcher_substring() {
        let mut m = KeywordMatcher::new();
        m.insert("ads");
        assert!(m.matches("cdn.ads.example.com"));
        assert!(!m.matches("example.com"));
    }

    #[test]
    fn mixer_dispatches_by_prefix() {
        let mut mixer = DomainMixer::new();
        mixer.push_pattern("full:exact.example.com").unwrap();
        mixer.push_pattern("domain:suffix.example.com").unwrap();
        mixer.push_pattern("keyword:track").unwrap();
        mixer.push_pattern("regexp:^ad[0-9]+\\.example\\.com$").unwrap();

        assert!(mixer.matches("exact.example.com"));
        assert!(!mixer.matches("other.exact.example.com"));
        assert!(mixer.matches("a.suffix.example.com"));
        assert!(mixer.matches("tracker.example.com"));
        assert!(mixer.matches("ad42.example.com"));
        assert!(!mixer.matches("ads.example.com"));
    }

    #[test]
    fn regex_matcher_caches_results() {
        let mut rm = RegexMatcher::new(Some(16));
        rm.insert("^foo").unwrap();
        assert!(rm.matches("foo.bar"));
        assert!(rm.matches("foo.bar")); // second lookup hits the cache
        assert!(!rm.matches("bar.foo"));
    }
}
