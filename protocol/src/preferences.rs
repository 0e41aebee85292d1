//! User preference profile: the state reconciled between the local cache
//! and the server.

use serde::Deserialize;
use serde::Serialize;

use crate::Timestamp;

/// A selected sport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SportPreference {
    pub sport_id: String,
    #[serde(default)]
    pub name: String,
    /// 1-based ordering chosen by the user.
    #[serde(default)]
    pub rank: u32,
}

impl SportPreference {
    pub fn new(sport_id: impl Into<String>, name: impl Into<String>, rank: u32) -> Self {
        Self {
            sport_id: sport_id.into(),
            name: name.into(),
            rank,
        }
    }
}

/// A followed team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamPreference {
    pub team_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sport_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub league: Option<String>,
    /// Opaque preference strength; carried, never interpreted here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity_score: Option<f64>,
}

impl TeamPreference {
    pub fn new(
        team_id: impl Into<String>,
        name: impl Into<String>,
        sport_id: impl Into<String>,
    ) -> Self {
        Self {
            team_id: team_id.into(),
            name: name.into(),
            sport_id: sport_id.into(),
            league: None,
            affinity_score: None,
        }
    }
}

/// Enablement and priority for one news category.
///
/// Lower `priority` means more important.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsTypePreference {
    #[serde(rename = "type")]
    pub news_type: String,
    pub enabled: bool,
    pub priority: u32,
}

impl NewsTypePreference {
    pub fn new(news_type: impl Into<String>, enabled: bool, priority: u32) -> Self {
        Self {
            news_type: news_type.into(),
            enabled,
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    pub push: bool,
    pub email: bool,
    pub game_reminders: bool,
    pub news_alerts: bool,
    pub score_updates: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            push: true,
            email: false,
            game_reminders: true,
            news_alerts: false,
            score_updates: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFrequency {
    Minimal,
    #[default]
    Standard,
    Comprehensive,
}

impl std::fmt::Display for ContentFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Minimal => "minimal",
            Self::Standard => "standard",
            Self::Comprehensive => "comprehensive",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPreferences {
    #[serde(default)]
    pub news_types: Vec<NewsTypePreference>,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub content_frequency: ContentFrequency,
}

/// The onboarding result as stored locally and on the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub sports: Vec<SportPreference>,
    #[serde(default)]
    pub teams: Vec<TeamPreference>,
    #[serde(default)]
    pub preferences: ContentPreferences,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

impl UserPreferences {
    pub fn sport_ids(&self) -> Vec<&str> {
        sorted(self.sports.iter().map(|s| s.sport_id.as_str()))
    }

    pub fn team_ids(&self) -> Vec<&str> {
        sorted(self.teams.iter().map(|t| t.team_id.as_str()))
    }

    /// Names of the news types that are switched on.
    pub fn enabled_news_types(&self) -> Vec<&str> {
        sorted(
            self.preferences
                .news_types
                .iter()
                .filter(|n| n.enabled)
                .map(|n| n.news_type.as_str()),
        )
    }
}

fn sorted<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut ids: Vec<&str> = ids.collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}
