//! Canonical vocabulary shared by every adapter: sport slugs, outcome names,
//! decimal odds sanity.

use crate::SportRef;

pub struct CanonicalSport {
    pub slug: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
    pub sort_order: i32,
    /// Whether a draw is a regular-time outcome.
    pub has_draw: bool,
}

pub const SPORTS: &[CanonicalSport] = &[
    CanonicalSport { slug: "football",          name: "Football",          icon: "soccer-ball",   sort_order: 1,  has_draw: true },
    CanonicalSport { slug: "basketball",        name: "Basketball",        icon: "basketball",    sort_order: 2,  has_draw: false },
    CanonicalSport { slug: "tennis",            name: "Tennis",            icon: "tennis-ball",   sort_order: 3,  has_draw: false },
    CanonicalSport { slug: "ice-hockey",        name: "Ice Hockey",        icon: "hockey-puck",   sort_order: 4,  has_draw: true },
    CanonicalSport { slug: "american-football", name: "American Football", icon: "football",      sort_order: 5,  has_draw: false },
    CanonicalSport { slug: "baseball",          name: "Baseball",          icon: "baseball",      sort_order: 6,  has_draw: false },
    CanonicalSport { slug: "volleyball",        name: "Volleyball",        icon: "volleyball",    sort_order: 7,  has_draw: false },
    CanonicalSport { slug: "handball",          name: "Handball",          icon: "handball",      sort_order: 8,  has_draw: true },
    CanonicalSport { slug: "rugby",             name: "Rugby",             icon: "rugby-ball",    sort_order: 9,  has_draw: true },
    CanonicalSport { slug: "cricket",           name: "Cricket",           icon: "cricket",       sort_order: 10, has_draw: true },
    CanonicalSport { slug: "mma",               name: "MMA",               icon: "glove",         sort_order: 11, has_draw: false },
    CanonicalSport { slug: "table-tennis",      name: "Table Tennis",      icon: "ping-pong",     sort_order: 12, has_draw: false },
    CanonicalSport { slug: "esports",           name: "Esports",           icon: "gamepad",       sort_order: 13, has_draw: false },
];

pub fn canonical_sport(slug: &str) -> Option<&'static CanonicalSport> {
    SPORTS.iter().find(|s| s.slug == slug)
}

pub fn sport_has_draw(slug: &str) -> bool {
    canonical_sport(slug).map_or(false, |s| s.has_draw)
}

/// Canonical sport reference; unknown slugs get a generic entry sorted last.
pub fn sport_ref(slug: &str) -> SportRef {
    match canonical_sport(slug) {
        Some(s) => SportRef {
            slug: s.slug.to_string(),
            name: s.name.to_string(),
            icon: s.icon.to_string(),
            sort_order: s.sort_order,
        },
        None => SportRef {
            slug: slug.to_string(),
            name: title_case(slug),
            icon: "trophy".to_string(),
            sort_order: 99,
        },
    }
}

fn title_case(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Maps a raw selection label to HOME/AWAY/DRAW/OVER/UNDER, or an upper-cased
/// named outcome (outrights, props).
pub fn canonical_outcome(raw: &str, home: &str, away: &str) -> String {
    let label = raw.trim();
    let lower = label.to_lowercase();
    if !home.is_empty() && label.eq_ignore_ascii_case(home.trim()) {
        return "HOME".into();
    }
    if !away.is_empty() && label.eq_ignore_ascii_case(away.trim()) {
        return "AWAY".into();
    }
    let first_word = lower.split_whitespace().next().unwrap_or("");
    match first_word {
        "1" | "home" | "home_od" | "w1" => "HOME".into(),
        "2" | "away" | "away_od" | "w2" => "AWAY".into(),
        "x" | "draw" | "tie" | "draw_od" => "DRAW".into(),
        "over" | "o" | "over_od" => "OVER".into(),
        "under" | "u" | "under_od" => "UNDER".into(),
        _ => label.to_uppercase().split_whitespace().collect::<Vec<_>>().join("_"),
    }
}

/// Decimal odds inside a sane range, from either a number or a numeric string.
pub fn parse_odds(raw: &serde_json::Value) -> Option<f64> {
    let val = match raw {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if (1.01..=1000.0).contains(&val) {
        Some(val)
    } else {
        None
    }
}

/// Number embedded in a label such as "Over 2.5" or "Home -1.5".
pub fn trailing_number(label: &str) -> Option<f64> {
    label.split_whitespace().last().and_then(|w| w.trim_start_matches('+').parse::<f64>().ok())
}
