use std::collections::BTreeMap;

use track_mux::Aggregator;

/// Counts hashtag tokens (`#` followed by at least one letter). Runs of `#` collapse to one.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashtagFrequencies;

impl Aggregator for HashtagFrequencies {
    fn frequencies(&self, tokens: &[&str]) -> BTreeMap<String, u32> {
        let mut counts = BTreeMap::new();
        for token in tokens {
            let Some(tag) = token.strip_prefix('#') else {
                continue;
            };
            let tag = tag.trim_start_matches('#');
            if tag.is_empty() || tag.contains('#') {
                continue;
            }
            *counts.entry(format!("#{tag}")).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn counts_only_hashtags() {
        let counts =
            HashtagFrequencies.frequencies(&["#dog", "love", "#dog", "#cat", "#", "##puppy"]);
        assert_eq!(counts.get("#dog"), Some(&2));
        assert_eq!(counts.get("#cat"), Some(&1));
        assert_eq!(counts.get("#puppy"), Some(&1));
        assert_eq!(counts.get("love"), None);
        assert_eq!(counts.len(), 3);
    }

    #[test_timeout::timeout]
    fn glued_hashtags_are_ignored() {
        let counts = HashtagFrequencies.frequencies(&["#one#two"]);
        assert!(counts.is_empty());
    }
}
