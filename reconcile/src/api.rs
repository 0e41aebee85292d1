use async_trait::async_trait;
use huddle_protocol::ContentPreferences;
use huddle_protocol::UserPreferences;
use huddle_retry::RequestError;
use serde::Deserialize;
use serde::Serialize;

/// Server-side preference profile operations.
#[async_trait]
pub trait ProfileApi: Send + Sync {
    /// Fetch the stored profile. A missing profile is `Ok(None)`, not an error.
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<UserPreferences>, RequestError>;

    async fn create_profile(
        &self,
        request: &CreateProfileRequest,
    ) -> Result<UserPreferences, RequestError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SportSelection {
    pub sport_id: String,
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSelection {
    pub team_id: String,
    pub affinity_score: f64,
}

/// Body the server expects when creating a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProfileRequest {
    pub user_id: String,
    pub sports: Vec<SportSelection>,
    pub teams: Vec<TeamSelection>,
    pub preferences: ContentPreferences,
    pub onboarding_completed: bool,
}

/// Affinity sent for teams the user followed without rating.
pub const DEFAULT_TEAM_AFFINITY: f64 = 0.5;

impl CreateProfileRequest {
    pub fn from_preferences(user_id: &str, prefs: &UserPreferences) -> Self {
        let sports = prefs
            .sports
            .iter()
            .enumerate()
            .map(|(index, sport)| SportSelection {
                sport_id: sport.sport_id.clone(),
                rank: if sport.rank > 0 {
                    sport.rank
                } else {
                    u32::try_from(index + 1).unwrap_or(u32::MAX)
                },
            })
            .collect();
        let teams = prefs
            .teams
            .iter()
            .map(|team| TeamSelection {
                team_id: team.team_id.clone(),
                affinity_score: team.affinity_score.unwrap_or(DEFAULT_TEAM_AFFINITY),
            })
            .collect();
        Self {
            user_id: user_id.to_string(),
            sports,
            teams,
            preferences: prefs.preferences.clone(),
            onboarding_completed: true,
        }
    }
}
