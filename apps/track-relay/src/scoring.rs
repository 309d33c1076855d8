//! Lexicon-based sentiment scoring.
//!
//! A compact rule-based scorer in the style of VADER: each known word carries a valence in
//! roughly [-4, 4], boosters and dampeners adjust the following word, a negation within the
//! three preceding words flips and shrinks it, and exclamation marks amplify the total. The
//! summed valence is squashed into a compound score in [-1, 1] and split into
//! positive/negative/neutral proportions.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use track_mux::{Polarity, Scorer};

const NEGATION_SCALAR: f64 = -0.74;
const BOOST: f64 = 0.293;
const EXCLAMATION_BOOST: f64 = 0.292;
const MAX_EXCLAMATIONS: usize = 4;
const QUESTION_BOOST: f64 = 0.18;
const NORMALIZATION_ALPHA: f64 = 15.0;

const LEXICON: &[(&str, f64)] = &[
    ("love", 3.2),
    ("loved", 2.9),
    ("loves", 2.7),
    ("lovely", 2.8),
    ("like", 1.5),
    ("likes", 1.5),
    ("good", 1.9),
    ("great", 3.1),
    ("awesome", 3.1),
    ("amazing", 2.8),
    ("excellent", 2.7),
    ("fantastic", 2.6),
    ("wonderful", 2.7),
    ("happy", 2.7),
    ("glad", 2.0),
    ("nice", 1.8),
    ("cute", 2.0),
    ("best", 3.2),
    ("fun", 2.3),
    ("win", 2.8),
    ("wins", 2.7),
    ("beautiful", 2.9),
    ("thanks", 1.9),
    ("thank", 1.5),
    ("cool", 1.3),
    ("yay", 2.4),
    ("lol", 1.8),
    ("haha", 2.0),
    ("hope", 1.9),
    ("enjoy", 2.2),
    ("perfect", 2.7),
    ("bad", -2.5),
    ("worse", -2.1),
    ("worst", -3.1),
    ("terrible", -2.1),
    ("awful", -2.0),
    ("horrible", -2.5),
    ("hate", -2.7),
    ("hates", -1.9),
    ("hated", -3.2),
    ("sad", -2.1),
    ("angry", -2.3),
    ("mad", -2.2),
    ("ugly", -2.3),
    ("boring", -1.3),
    ("lose", -1.3),
    ("lost", -1.3),
    ("fail", -2.5),
    ("fails", -1.8),
    ("sick", -1.7),
    ("pain", -2.3),
    ("hurt", -2.4),
    ("cry", -2.1),
    ("kill", -3.7),
    ("dead", -3.3),
    ("disaster", -3.1),
    ("scary", -2.2),
    ("annoying", -1.7),
    ("stupid", -2.4),
    ("wtf", -2.8),
    ("sucks", -1.5),
    ("problem", -1.7),
];

const BOOSTERS: &[&str] = &[
    "very",
    "really",
    "so",
    "extremely",
    "totally",
    "absolutely",
    "incredibly",
    "super",
    "most",
    "completely",
];

const DAMPENERS: &[&str] = &["kinda", "somewhat", "slightly", "barely", "hardly", "little"];

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "none", "nobody", "nothing", "neither", "nor", "cannot", "without",
    "isn't", "aren't", "wasn't", "weren't", "don't", "doesn't", "didn't", "can't", "won't",
    "wouldn't", "shouldn't", "couldn't", "ain't",
];

static VALENCES: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| LEXICON.iter().copied().collect());

#[derive(Debug, Default, Clone, Copy)]
pub struct LexiconScorer;

impl LexiconScorer {
    pub fn new() -> Self {
        Self
    }
}

impl Scorer for LexiconScorer {
    fn score(&self, text: &str) -> Polarity {
        let words: Vec<&str> = text
            .split_whitespace()
            .map(|token| token.trim_matches(|c: char| matches!(c, '!' | '?' | '#')))
            .filter(|word| !word.is_empty())
            .collect();

        let mut sentiments = Vec::with_capacity(words.len());
        for (index, word) in words.iter().enumerate() {
            let Some(&base) = VALENCES.get(word) else {
                sentiments.push(0.0);
                continue;
            };
            let mut valence = base;
            if let Some(previous) = index.checked_sub(1).map(|i| words[i]) {
                let scalar = if BOOSTERS.contains(&previous) {
                    BOOST
                } else if DAMPENERS.contains(&previous) {
                    -BOOST
                } else {
                    0.0
                };
                valence += scalar * valence.signum();
            }
            let window = &words[index.saturating_sub(3)..index];
            if window.iter().any(|candidate| NEGATIONS.contains(candidate)) {
                valence *= NEGATION_SCALAR;
            }
            sentiments.push(valence);
        }

        let mut sum: f64 = sentiments.iter().sum();
        if sum != 0.0 {
            let exclamations = text.matches('!').count().min(MAX_EXCLAMATIONS);
            let questions = if text.matches('?').count() > 1 {
                QUESTION_BOOST
            } else {
                0.0
            };
            let emphasis = exclamations as f64 * EXCLAMATION_BOOST + questions;
            sum += emphasis * sum.signum();
        }
        let compound = normalize(sum);

        let neutral = sentiments.iter().filter(|value| **value == 0.0).count() as f64;
        let mut positive: f64 = sentiments
            .iter()
            .filter(|value| **value > 0.0)
            .map(|value| value + 1.0)
            .sum();
        let mut negative: f64 = sentiments
            .iter()
            .filter(|value| **value < 0.0)
            .map(|value| value - 1.0)
            .sum::<f64>()
            .abs();
        if positive > negative {
            positive += text.matches('!').count().min(MAX_EXCLAMATIONS) as f64 * EXCLAMATION_BOOST;
        } else if negative > positive {
            negative += text.matches('!').count().min(MAX_EXCLAMATIONS) as f64 * EXCLAMATION_BOOST;
        }

        let total = positive + negative + neutral;
        if total == 0.0 {
            return Polarity {
                neg: 0.0,
                neu: 1.0,
                pos: 0.0,
                compound: 0.0,
            };
        }
        Polarity {
            neg: round3(negative / total),
            neu: round3(neutral / total),
            pos: round3(positive / total),
            compound: round4(compound),
        }
    }
}

fn normalize(score: f64) -> f64 {
    let normalized = score / (score * score + NORMALIZATION_ALPHA).sqrt();
    normalized.clamp(-1.0, 1.0)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn round4(value: f64) -> f64 {
    (value * 10000.0).round() / 10000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(text: &str) -> Polarity {
        LexiconScorer::new().score(text)
    }

    #[test_timeout::timeout]
    fn neutral_text_scores_zero() {
        let polarity = score("the bus leaves at noon");
        assert_eq!(polarity.compound, 0.0);
        assert_eq!(polarity.neu, 1.0);
        assert_eq!(polarity.pos, 0.0);
        assert_eq!(polarity.neg, 0.0);
    }

    #[test_timeout::timeout]
    fn positive_and_negative_words_set_the_sign() {
        assert!(score("i love my dog").compound > 0.5);
        assert!(score("this is terrible").compound < 0.0);
    }

    #[test_timeout::timeout]
    fn negation_flips_polarity() {
        let plain = score("this is good");
        let negated = score("this is not good");
        assert!(plain.compound > 0.0);
        assert!(negated.compound < 0.0);
    }

    #[test_timeout::timeout]
    fn boosters_and_exclamations_intensify() {
        let base = score("great day").compound;
        assert!(score("really great day").compound > base);
        assert!(score("great day!!!").compound > base);
    }

    #[test_timeout::timeout]
    fn proportions_sum_to_one() {
        let polarity = score("i love cats but hate rain!");
        let total = polarity.neg + polarity.neu + polarity.pos;
        assert!((total - 1.0).abs() < 0.01, "proportions summed to {total}");
        assert!((-1.0..=1.0).contains(&polarity.compound));
    }
}
