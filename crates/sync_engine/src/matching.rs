//! Cross-provider fixture matching.
//!
//! Precedence:
//!   1. exact external id (handled by the store lookup before this runs)
//!   2. both team names equal after normalisation, start inside the window
//!   3. both team names loosely equal (prefix / substring / reordered words)
//!
//! The window and the 4-character floor on substring matches are empirical.

use chrono::{DateTime, Duration, Utc};
use feed_model::Event;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Club-form tokens that differ between feeds for the same team.
const NOISE_WORDS: &[&str] = &["fc", "cf", "sc", "afc", "ac", "the", "club"];

const MIN_PARTIAL_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NameMatch {
    Exact,
    Partial,
}

/// Lowercase, accents stripped, punctuation to spaces, noise words dropped.
pub fn normalize_team(name: &str) -> String {
    let folded: String = name
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded
        .split_whitespace()
        .filter(|w| !NOISE_WORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn team_names_match(a: &str, b: &str) -> Option<NameMatch> {
    let a = normalize_team(a);
    let b = normalize_team(b);
    if a.is_empty() || b.is_empty() {
        return None;
    }
    if a == b {
        return Some(NameMatch::Exact);
    }
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    if short.chars().count() >= MIN_PARTIAL_LEN && (long.starts_with(short.as_str()) || long.contains(short.as_str())) {
        return Some(NameMatch::Partial);
    }
    // "Masarova Rebeka" vs "Rebeka Masarova"
    let mut wa: Vec<&str> = a.split(' ').collect();
    let mut wb: Vec<&str> = b.split(' ').collect();
    if wa.len() >= 2 && wa.len() == wb.len() {
        wa.sort_unstable();
        wb.sort_unstable();
        if wa == wb {
            return Some(NameMatch::Partial);
        }
    }
    None
}

/// Best existing event for a provider fixture, or `None`.
///
/// Candidates that already carry an id from `provider` are skipped: the first
/// provider to claim an event keeps it.
pub fn best_match<'a>(
    provider: &str,
    home: &str,
    away: &str,
    start_time: DateTime<Utc>,
    window: Duration,
    candidates: &'a [Event],
) -> Option<&'a Event> {
    candidates
        .iter()
        .filter(|c| !c.has_provider(provider))
        .filter(|c| (c.start_time - start_time).abs() <= window)
        .filter_map(|c| {
            let h = team_names_match(home, &c.home_team)?;
            let a = team_names_match(away, &c.away_team)?;
            let rank = h.max(a);
            let gap = (c.start_time - start_time).num_seconds().abs();
            Some((rank, gap, c.id, c))
        })
        .min_by_key(|(rank, gap, id, _)| (*rank, *gap, *id))
        .map(|(.., c)| c)
}
