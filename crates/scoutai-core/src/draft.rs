// Draft snapshot and scoring-service data model.
//
// `DraftSnapshot` is what the page extractor hands back for
// EXTRACT_DRAFT_STATE. `DraftRequest`/`DraftResponse` are the bodies of the
// scoring service's `POST /recommendations`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::platform::Platform;

/// Fantasy football positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    QB,
    RB,
    WR,
    TE,
    K,
    DST,
}

impl Position {
    pub const ALL: [Position; 6] = [
        Position::QB,
        Position::RB,
        Position::WR,
        Position::TE,
        Position::K,
        Position::DST,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Position::QB => "QB",
            Position::RB => "RB",
            Position::WR => "WR",
            Position::TE => "TE",
            Position::K => "K",
            Position::DST => "DST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub position: Position,
    pub team: String,
    /// Average draft position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projected_points: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bye_week: Option<u32>,
}

/// The user's drafted players grouped by position. Field names are
/// UPPERCASE to match the wire keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct Roster {
    #[serde(default)]
    pub QB: Vec<String>,
    #[serde(default)]
    pub RB: Vec<String>,
    #[serde(default)]
    pub WR: Vec<String>,
    #[serde(default)]
    pub TE: Vec<String>,
    #[serde(default)]
    pub K: Vec<String>,
    #[serde(default)]
    pub DST: Vec<String>,
}

impl Roster {
    pub fn players_at(&self, position: Position) -> &[String] {
        match position {
            Position::QB => &self.QB,
            Position::RB => &self.RB,
            Position::WR => &self.WR,
            Position::TE => &self.TE,
            Position::K => &self.K,
            Position::DST => &self.DST,
        }
    }

    /// `(position, count)` for every position, in display order.
    pub fn counts(&self) -> Vec<(Position, usize)> {
        Position::ALL
            .into_iter()
            .map(|p| (p, self.players_at(p).len()))
            .collect()
    }
}

/// Structured snapshot of the draft table on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftSnapshot {
    pub current_pick: u32,
    pub current_round: u32,
    pub user_roster: Roster,
    pub available_players: Vec<Player>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Body of `POST /recommendations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftRequest {
    pub current_pick: u32,
    pub current_round: u32,
    pub user_roster: Roster,
    pub available_players: Vec<Player>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub league_settings: Map<String, Value>,
}

impl From<&DraftSnapshot> for DraftRequest {
    fn from(snapshot: &DraftSnapshot) -> Self {
        DraftRequest {
            current_pick: snapshot.current_pick,
            current_round: snapshot.current_round,
            user_roster: snapshot.user_roster.clone(),
            available_players: snapshot.available_players.clone(),
            league_settings: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub player: Player,
    /// In `[0, 1]`.
    pub confidence_score: f64,
    pub predicted_points: f64,
    /// In `[0, 1]`.
    pub boom_probability: f64,
    pub value_over_replacement: f64,
    pub explanation: String,
    pub risk_level: RiskLevel,
}

impl Recommendation {
    /// Whether the probability fields are inside `[0, 1]`.
    pub fn is_well_formed(&self) -> bool {
        let unit = 0.0..=1.0;
        unit.contains(&self.confidence_score) && unit.contains(&self.boom_probability)
    }
}

/// Response of `POST /recommendations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftResponse {
    pub recommendations: Vec<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roster_analysis: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_strategy: Option<String>,
}
