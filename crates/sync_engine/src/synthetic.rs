//! Synthetic prices and scores for events no feed prices or scores.
//!
//! Win probabilities are drawn from bounded ranges, a fixed margin is applied,
//! and the result is clamped to a sane decimal range.

use feed_model::{MarketType, Scores};
use providers::vocab::sport_has_draw;
use providers::{ProviderMarket, ProviderSelection};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticOddsConfig {
    /// Bookmaker overround, 0.05 = 5 %.
    pub margin: f64,
    pub min_odds: f64,
    pub max_odds: f64,
}

impl Default for SyntheticOddsConfig {
    fn default() -> Self {
        Self { margin: 0.05, min_odds: 1.01, max_odds: 50.0 }
    }
}

/// Decimal price for `probability` after margin, two decimals, clamped.
pub fn price(probability: f64, config: &SyntheticOddsConfig) -> f64 {
    let raw = 1.0 / (probability * (1.0 + config.margin));
    let rounded = (raw * 100.0).round() / 100.0;
    rounded.clamp(config.min_odds, config.max_odds)
}

/// Main total line quoted for a sport.
pub fn default_total_line(sport_slug: &str) -> f64 {
    match sport_slug {
        "football" => 2.5,
        "basketball" => 210.5,
        "ice-hockey" => 5.5,
        "tennis" => 22.5,
        "baseball" => 8.5,
        "american-football" => 44.5,
        "handball" => 54.5,
        "volleyball" => 4.5,
        "rugby" => 45.5,
        _ => 2.5,
    }
}

/// Plausible final score for a sport.
pub fn synthetic_score<R: Rng>(sport_slug: &str, rng: &mut R) -> Scores {
    let pair = |rng: &mut R, lo: i32, hi: i32| Scores::new(rng.gen_range(lo..=hi), rng.gen_range(lo..=hi));
    match sport_slug {
        "football" => pair(rng, 0, 3),
        "basketball" => pair(rng, 80, 130),
        "ice-hockey" => pair(rng, 0, 5),
        "handball" => pair(rng, 20, 35),
        "baseball" => pair(rng, 0, 9),
        "american-football" => pair(rng, 3, 38),
        "rugby" => pair(rng, 3, 40),
        // set sports: winner takes the deciding set count
        "tennis" | "table-tennis" | "volleyball" => {
            let sets_to_win = if sport_slug == "volleyball" || sport_slug == "table-tennis" { 3 } else { 2 };
            let loser = rng.gen_range(0..sets_to_win);
            if rng.gen_bool(0.5) {
                Scores::new(sets_to_win, loser)
            } else {
                Scores::new(loser, sets_to_win)
            }
        }
        _ => pair(rng, 0, 3),
    }
}

pub struct SyntheticOdds {
    config: SyntheticOddsConfig,
    rng: Mutex<StdRng>,
}

impl SyntheticOdds {
    /// `seed` fixes the sequence for tests and replays.
    pub fn new(config: SyntheticOddsConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng: Mutex::new(rng) }
    }

    pub fn config(&self) -> &SyntheticOddsConfig {
        &self.config
    }

    /// Moneyline plus the main total for one event.
    pub fn markets(&self, sport_slug: &str, home_team: &str, away_team: &str) -> Vec<ProviderMarket> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        vec![
            self.moneyline(&mut *rng, sport_slug, home_team, away_team),
            self.total(&mut *rng, sport_slug),
        ]
    }

    fn moneyline(&self, rng: &mut StdRng, sport_slug: &str, home_team: &str, away_team: &str) -> ProviderMarket {
        let home: f64 = rng.gen_range(0.25..=0.65);
        let draw = if sport_has_draw(sport_slug) { rng.gen_range(0.20..=0.30) } else { 0.0 };
        let away = (1.0 - home - draw).max(0.05);

        let mut selections = vec![self.selection(home_team, "HOME", home)];
        if draw > 0.0 {
            selections.push(self.selection("Draw", "DRAW", draw));
        }
        selections.push(self.selection(away_team, "AWAY", away));
        ProviderMarket {
            raw_key: "synthetic_ml".into(),
            name: Some("Match Result".into()),
            market_type: Some(MarketType::Moneyline),
            period: None,
            line: None,
            selections,
        }
    }

    fn total(&self, rng: &mut StdRng, sport_slug: &str) -> ProviderMarket {
        let line = default_total_line(sport_slug);
        let over = rng.gen_range(0.40..=0.60);
        ProviderMarket {
            raw_key: "synthetic_totals".into(),
            name: Some(format!("Over/Under {line}")),
            market_type: Some(MarketType::Total),
            period: None,
            line: Some(line),
            selections: vec![
                self.selection(&format!("Over {line}"), "OVER", over),
                self.selection(&format!("Under {line}"), "UNDER", 1.0 - over),
            ],
        }
    }

    fn selection(&self, label: &str, outcome: &str, probability: f64) -> ProviderSelection {
        ProviderSelection {
            label: label.to_string(),
            outcome: outcome.to_string(),
            odds: price(probability, &self.config),
            handicap: None,
        }
    }
}
