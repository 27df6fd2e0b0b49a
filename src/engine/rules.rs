//! Scoring rules.
//!
//! Each rule looks at one player (plus a little week context) and may
//! return a signed adjustment with a reason. A [`Ruleset`] applies its
//! rules left to right; the reasons become the recommendation rationale.
//!
//! Rules form a closed set so rulesets can be declared in `config.toml`:
//!
//! ```toml
//! [[engine.ruleset.rules]]
//! kind = "injury"
//! out_penalty = 4.0
//! ```

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{EngineError, InjuryStatus, Player, Position};

// ---------------------------------------------------------------------------
// Rule capability
// ---------------------------------------------------------------------------

/// Context shared by every rule during one scoring pass.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    /// NFL week being scored.
    pub week: u32,
    /// Players per primary position in the evaluated pool.
    pub position_counts: HashMap<Position, usize>,
}

impl RuleContext {
    pub fn new(week: u32, players: &[Player]) -> Self {
        let mut position_counts = HashMap::new();
        for p in players {
            *position_counts.entry(p.position).or_insert(0) += 1;
        }
        Self { week, position_counts }
    }

    pub fn count_at(&self, position: Position) -> usize {
        self.position_counts.get(&position).copied().unwrap_or(0)
    }
}

/// One score adjustment produced by a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub delta: Decimal,
    pub reason: String,
}

/// The "score adjustment" capability every rule implements.
pub trait ScoreRule {
    /// Stable identifier used in rationale strings.
    fn name(&self) -> &'static str;

    /// Adjustment for `player`, or `None` when the rule does not fire.
    fn adjust(&self, player: &Player, ctx: &RuleContext) -> Option<Adjustment>;

    /// Reject nonsensical parameters.
    fn validate(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

fn non_negative(rule: &str, field: &str, value: Decimal) -> Result<(), EngineError> {
    if value < Decimal::ZERO {
        return Err(EngineError::InvalidRuleset(format!(
            "{rule}.{field} must not be negative (got {value})"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Built-in rules
// ---------------------------------------------------------------------------

/// Penalise injured players: Out/IR heavily, Questionable/Doubtful lightly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjuryRule {
    pub out_penalty: Decimal,
    pub questionable_penalty: Decimal,
}

impl Default for InjuryRule {
    fn default() -> Self {
        Self {
            out_penalty: dec!(4.0),
            questionable_penalty: dec!(2.0),
        }
    }
}

impl ScoreRule for InjuryRule {
    fn name(&self) -> &'static str {
        "injury"
    }

    fn adjust(&self, player: &Player, _ctx: &RuleContext) -> Option<Adjustment> {
        let penalty = match player.status {
            InjuryStatus::Out | InjuryStatus::InjuredReserve => self.out_penalty,
            InjuryStatus::Questionable | InjuryStatus::Doubtful => self.questionable_penalty,
            InjuryStatus::Healthy => return None,
        };
        if penalty.is_zero() {
            return None;
        }
        Some(Adjustment {
            delta: -penalty,
            reason: format!("status {}", player.status.code()),
        })
    }

    fn validate(&self) -> Result<(), EngineError> {
        non_negative(self.name(), "out_penalty", self.out_penalty)?;
        non_negative(self.name(), "questionable_penalty", self.questionable_penalty)
    }
}

/// Reward soft matchups: `(opponent rank - neutral) * weight`.
/// Rank 1 is the toughest defense, so higher ranks are easier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchupRule {
    pub weight: Decimal,
    pub neutral_rank: u32,
}

impl Default for MatchupRule {
    fn default() -> Self {
        Self {
            weight: dec!(0.1),
            neutral_rank: 16,
        }
    }
}

impl ScoreRule for MatchupRule {
    fn name(&self) -> &'static str {
        "matchup"
    }

    fn adjust(&self, player: &Player, _ctx: &RuleContext) -> Option<Adjustment> {
        let rank = player.opponent_def_rank?;
        let delta = (Decimal::from(rank) - Decimal::from(self.neutral_rank)) * self.weight;
        if delta.is_zero() {
            return None;
        }
        Some(Adjustment {
            delta,
            reason: format!("opponent defense rank {rank}"),
        })
    }

    fn validate(&self) -> Result<(), EngineError> {
        non_negative(self.name(), "weight", self.weight)
    }
}

/// A player on bye scores nothing this week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ByeWeekRule {
    pub penalty: Decimal,
}

impl Default for ByeWeekRule {
    fn default() -> Self {
        Self { penalty: dec!(100) }
    }
}

impl ScoreRule for ByeWeekRule {
    fn name(&self) -> &'static str {
        "bye_week"
    }

    fn adjust(&self, player: &Player, ctx: &RuleContext) -> Option<Adjustment> {
        if player.bye_week != Some(ctx.week) || self.penalty.is_zero() {
            return None;
        }
        Some(Adjustment {
            delta: -self.penalty,
            reason: format!("on bye in week {}", ctx.week),
        })
    }

    fn validate(&self) -> Result<(), EngineError> {
        non_negative(self.name(), "penalty", self.penalty)
    }
}

/// Follow snap-share momentum: `snap_trend * weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapTrendRule {
    pub weight: Decimal,
}

impl Default for SnapTrendRule {
    fn default() -> Self {
        Self { weight: dec!(10) }
    }
}

impl ScoreRule for SnapTrendRule {
    fn name(&self) -> &'static str {
        "snap_trend"
    }

    fn adjust(&self, player: &Player, _ctx: &RuleContext) -> Option<Adjustment> {
        let trend = player.snap_trend?;
        let delta = trend * self.weight;
        if delta.is_zero() {
            return None;
        }
        let direction = if delta > Decimal::ZERO { "rising" } else { "falling" };
        Some(Adjustment {
            delta,
            reason: format!("snap share {direction}"),
        })
    }

    fn validate(&self) -> Result<(), EngineError> {
        non_negative(self.name(), "weight", self.weight)
    }
}

/// Prefer steady producers: `-volatility * weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityRule {
    pub weight: Decimal,
}

impl Default for VolatilityRule {
    fn default() -> Self {
        Self { weight: dec!(0.25) }
    }
}

impl ScoreRule for VolatilityRule {
    fn name(&self) -> &'static str {
        "volatility"
    }

    fn adjust(&self, player: &Player, _ctx: &RuleContext) -> Option<Adjustment> {
        let vol = player.volatility?;
        let delta = -(vol.abs() * self.weight);
        if delta.is_zero() {
            return None;
        }
        Some(Adjustment {
            delta,
            reason: format!("weekly std dev {}", vol.round_dp(1)),
        })
    }

    fn validate(&self) -> Result<(), EngineError> {
        non_negative(self.name(), "weight", self.weight)
    }
}

// ---------------------------------------------------------------------------
// Closed rule set
// ---------------------------------------------------------------------------

/// Every rule the engine knows how to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    Injury(InjuryRule),
    Matchup(MatchupRule),
    ByeWeek(ByeWeekRule),
    SnapTrend(SnapTrendRule),
    Volatility(VolatilityRule),
}

impl Rule {
    fn inner(&self) -> &dyn ScoreRule {
        match self {
            Rule::Injury(r) => r,
            Rule::Matchup(r) => r,
            Rule::ByeWeek(r) => r,
            Rule::SnapTrend(r) => r,
            Rule::Volatility(r) => r,
        }
    }
}

impl ScoreRule for Rule {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn adjust(&self, player: &Player, ctx: &RuleContext) -> Option<Adjustment> {
        self.inner().adjust(player, ctx)
    }

    fn validate(&self) -> Result<(), EngineError> {
        self.inner().validate()
    }
}

/// Ordered, versioned collection of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    pub version: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Default for Ruleset {
    fn default() -> Self {
        Self::standard()
    }
}

impl Ruleset {
    /// The default heuristic: injury, matchup, bye, snap trend, volatility.
    pub fn standard() -> Self {
        Self {
            version: "standard-1".to_string(),
            rules: vec![
                Rule::Injury(InjuryRule::default()),
                Rule::Matchup(MatchupRule::default()),
                Rule::ByeWeek(ByeWeekRule::default()),
                Rule::SnapTrend(SnapTrendRule::default()),
                Rule::Volatility(VolatilityRule::default()),
            ],
        }
    }

    /// A ruleset that never adjusts: scores equal projections.
    pub fn empty(version: &str) -> Self {
        Self {
            version: version.to_string(),
            rules: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.version.trim().is_empty() {
            return Err(EngineError::InvalidRuleset("version must not be empty".into()));
        }
        self.rules.iter().try_for_each(|r| r.validate())
    }

    /// Apply every rule in order, collecting the ones that fire.
    pub fn apply(&self, player: &Player, ctx: &RuleContext) -> Vec<(&'static str, Adjustment)> {
        self.rules
            .iter()
            .filter_map(|rule| rule.adjust(player, ctx).map(|adj| (rule.name(), adj)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(week: u32) -> RuleContext {
        RuleContext {
            week,
            position_counts: HashMap::new(),
        }
    }

    #[test]
    fn test_injury_penalties() {
        let rule = InjuryRule::default();
        let mut p = Player::sample("1", Position::RB, Some(dec!(10)));
        assert!(rule.adjust(&p, &ctx(1)).is_none());

        p.status = InjuryStatus::Questionable;
        assert_eq!(rule.adjust(&p, &ctx(1)).unwrap().delta, dec!(-2.0));

        p.status = InjuryStatus::InjuredReserve;
        let adj = rule.adjust(&p, &ctx(1)).unwrap();
        assert_eq!(adj.delta, dec!(-4.0));
        assert_eq!(adj.reason, "status IR");
    }

    #[test]
    fn test_matchup_rule() {
        let rule = MatchupRule::default();
        let mut p = Player::sample("1", Position::WR, Some(dec!(10)));
        assert!(rule.adjust(&p, &ctx(1)).is_none());

        p.opponent_def_rank = Some(26);
        assert_eq!(rule.adjust(&p, &ctx(1)).unwrap().delta, dec!(1.0));

        p.opponent_def_rank = Some(6);
        assert_eq!(rule.adjust(&p, &ctx(1)).unwrap().delta, dec!(-1.0));

        p.opponent_def_rank = Some(16);
        assert!(rule.adjust(&p, &ctx(1)).is_none());
    }

    #[test]
    fn test_bye_week_only_in_bye_week() {
        let rule = ByeWeekRule::default();
        let mut p = Player::sample("1", Position::TE, Some(dec!(8)));
        p.bye_week = Some(9);
        assert!(rule.adjust(&p, &ctx(8)).is_none());
        assert_eq!(rule.adjust(&p, &ctx(9)).unwrap().delta, dec!(-100));
    }

    #[test]
    fn test_snap_trend_and_volatility() {
        let mut p = Player::sample("1", Position::RB, Some(dec!(12)));
        p.snap_trend = Some(dec!(0.15));
        p.volatility = Some(dec!(6));
        assert_eq!(
            SnapTrendRule::default().adjust(&p, &ctx(1)).unwrap().delta,
            dec!(1.5)
        );
        assert_eq!(
            VolatilityRule::default().adjust(&p, &ctx(1)).unwrap().delta,
            dec!(-1.5)
        );
    }

    #[test]
    fn test_ruleset_applies_in_order() {
        let mut p = Player::sample("1", Position::RB, Some(dec!(12)));
        p.status = InjuryStatus::Questionable;
        p.opponent_def_rank = Some(20);
        let fired = Ruleset::standard().apply(&p, &ctx(1));
        let names: Vec<&str> = fired.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["injury", "matchup"]);
    }

    #[test]
    fn test_validate_rejects_negative_weight() {
        let ruleset = Ruleset {
            version: "x".into(),
            rules: vec![Rule::Matchup(MatchupRule {
                weight: dec!(-1),
                neutral_rank: 16,
            })],
        };
        assert!(matches!(ruleset.validate(), Err(EngineError::InvalidRuleset(_))));
        assert!(Ruleset::empty("").validate().is_err());
        assert!(Ruleset::standard().validate().is_ok());
    }

    #[test]
    fn test_rule_serde_tagging() {
        let json = serde_json::to_value(Rule::ByeWeek(ByeWeekRule::default())).unwrap();
        assert_eq!(json["kind"], "bye_week");
        let back: Rule = serde_json::from_value(json).unwrap();
        assert_eq!(back, Rule::ByeWeek(ByeWeekRule::default()));
    }

    #[test]
    fn test_context_position_counts() {
        let players = vec![
            Player::sample("1", Position::RB, None),
            Player::sample("2", Position::RB, None),
            Player::sample("3", Position::TE, None),
        ];
        let c = RuleContext::new(3, &players);
        assert_eq!(c.count_at(Position::RB), 2);
        assert_eq!(c.count_at(Position::TE), 1);
        assert_eq!(c.count_at(Position::QB), 0);
    }
}
