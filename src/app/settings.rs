use serde::{Deserialize, Serialize};

use crate::error::{invalid_input, RunnerResult};
use crate::leaderboard::LeaderboardSettings;
use crate::monetization::MonetizationSettings;
use crate::queue::QueueSettings;
use crate::sync::SyncSettings;

/// Every tunable of a session, grouped per component.
///
/// Missing sections and fields fall back to their defaults, so a host only ships overrides:
///
/// ```
/// use runner_sync::app::RunnerSettings;
///
/// let settings = RunnerSettings::from_json_str(
///     r#"{ "leaderboard": { "min_submit_interval_millis": 2000 } }"#,
/// )
/// .unwrap();
/// assert_eq!(settings.leaderboard.min_submit_interval_millis, 2_000);
/// assert_eq!(settings.sync.drain_batch_size, 20);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub queue: QueueSettings,
    pub sync: SyncSettings,
    pub leaderboard: LeaderboardSettings,
    pub monetization: MonetizationSettings,
}

impl RunnerSettings {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> RunnerResult<Self> {
        let settings: RunnerSettings = serde_json::from_str(json)
            .map_err(|err| invalid_input(format!("invalid settings document: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json_string(&self) -> RunnerResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| invalid_input(format!("settings are not serialisable: {err}")))
    }

    pub fn validate(&self) -> RunnerResult<()> {
        self.queue.validate()?;
        self.sync.validate()?;
        self.leaderboard.validate()?;
        self.monetization.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerErrorCode;

    #[test]
    fn empty_document_yields_defaults() {
        let settings = RunnerSettings::from_json_str("{}").unwrap();
        assert_eq!(settings, RunnerSettings::default());
    }

    #[test]
    fn serialised_defaults_parse_back() {
        let json = RunnerSettings::default().to_json_string().unwrap();
        assert_eq!(
            RunnerSettings::from_json_str(&json).unwrap(),
            RunnerSettings::default()
        );
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let err = RunnerSettings::from_json_str(r#"{ "sync": { "drain_interval_millis": 0 } }"#)
            .unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::InvalidInput);

        let err =
            RunnerSettings::from_json_str(r#"{ "leaderboard": { "ranking_interval_millis": 0 } }"#)
                .unwrap_err();
        assert!(err.to_string().contains("ranking_interval_millis"));
    }

    #[test]
    fn malformed_json_is_invalid_input() {
        let err = RunnerSettings::from_json_str("{ not json").unwrap_err();
        assert_eq!(err.code, RunnerErrorCode::InvalidInput);
    }
}
