// Draft-state extraction from the host page.

use serde::Deserialize;
use tracing::{debug, warn};

use scoutai_core::draft::{DraftSnapshot, Player, Roster};
use scoutai_core::platform::Platform;

use super::dom::Document;

/// Id of the embedded JSON block the headless pages carry their draft table in.
pub const DRAFT_ISLAND_ID: &str = "scoutai-draft-state";

/// Reads the current draft table off a page.
pub trait DraftExtractor: Send + Sync {
    /// `None` if the page shows no draft.
    fn extract(&self, document: &dyn Document) -> Option<DraftSnapshot>;
}

/// Page payload as embedded by the draft room.
#[derive(Debug, Deserialize)]
struct IslandPayload {
    current_pick: u32,
    current_round: u32,
    #[serde(default)]
    user_roster: Roster,
    #[serde(default)]
    available_players: Vec<Player>,
}

/// Reads the draft table from a JSON data island and stamps it with the
/// platform detected from the page URL.
#[derive(Debug, Clone)]
pub struct DataIslandExtractor {
    island_id: String,
}

impl DataIslandExtractor {
    pub fn new(island_id: impl Into<String>) -> Self {
        DataIslandExtractor {
            island_id: island_id.into(),
        }
    }
}

impl Default for DataIslandExtractor {
    fn default() -> Self {
        Self::new(DRAFT_ISLAND_ID)
    }
}

impl DraftExtractor for DataIslandExtractor {
    fn extract(&self, document: &dyn Document) -> Option<DraftSnapshot> {
        let Some(text) = document.data_island(&self.island_id) else {
            debug!(island = %self.island_id, "No draft data on page");
            return None;
        };
        let payload: IslandPayload = match serde_json::from_str(&text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(island = %self.island_id, "Unreadable draft data: {e}");
                return None;
            }
        };
        Some(DraftSnapshot {
            current_pick: payload.current_pick,
            current_round: payload.current_round,
            user_roster: payload.user_roster,
            available_players: payload.available_players,
            platform: Some(Platform::detect(&document.url())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::dom::HeadlessDocument;
    use scoutai_core::draft::Position;

    #[test]
    fn reads_island_and_detects_platform() {
        let doc = HeadlessDocument::loaded("https://football.fantasysports.yahoo.com/f1/draft");
        doc.set_data_island(
            DRAFT_ISLAND_ID,
            r#"{"current_pick": 14, "current_round": 2,
                "user_roster": {"QB": ["Josh Allen"]},
                "available_players": [{"name": "Puka Nacua", "position": "WR", "team": "LAR"}]}"#,
        );
        let snapshot = DataIslandExtractor::default().extract(&doc).unwrap();
        assert_eq!(snapshot.current_pick, 14);
        assert_eq!(snapshot.current_round, 2);
        assert_eq!(snapshot.user_roster.players_at(Position::QB), ["Josh Allen"]);
        assert_eq!(snapshot.available_players[0].position, Position::WR);
        assert_eq!(snapshot.platform, Some(Platform::Yahoo));
    }

    #[test]
    fn missing_or_broken_island_is_no_draft() {
        let doc = HeadlessDocument::loaded("https://fantasy.espn.com/football/draft");
        let extractor = DataIslandExtractor::default();
        assert!(extractor.extract(&doc).is_none());
        doc.set_data_island(DRAFT_ISLAND_ID, "{not json");
        assert!(extractor.extract(&doc).is_none());
    }
}
