//! Persisted schedule jobs

use serde::{Deserialize, Serialize};

use crate::EntityType;

/// Kind of schedule job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    /// Fires once, then is deleted
    RunOnce,
    /// Fires on a recurrence until unscheduled
    RunEvery,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::RunOnce => "runOnce",
            JobType::RunEvery => "runEvery",
        }
    }
}

/// When a job fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Schedule {
    /// Absolute fire time in epoch milliseconds
    At(i64),
    /// Recurrence expression
    Cron(String),
}

/// `${jobType}_${entityType}_${entityId}_${handlerMethod}`
pub fn job_key(
    job_type: JobType,
    entity_type: EntityType,
    entity_id: &str,
    handler_method: &str,
) -> String {
    format!(
        "{}_{}_{}_{}",
        job_type.as_str(),
        entity_type,
        entity_id,
        handler_method
    )
}

/// A durable scheduled invocation of an entity method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleJob {
    pub job_key: String,
    pub job_type: JobType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub handler_method: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub schedule: Schedule,
}

impl ScheduleJob {
    /// Whether this job belongs to the entity (and handler, when given)
    pub fn belongs_to(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        handler_method: Option<&str>,
    ) -> bool {
        self.entity_type == entity_type
            && self.entity_id == entity_id
            && handler_method.map_or(true, |h| self.handler_method == h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_convention() {
        assert_eq!(
            job_key(JobType::RunOnce, EntityType::SmartApp, "A1", "turnOff"),
            "runOnce_SMARTAPP_A1_turnOff"
        );
    }

    #[test]
    fn test_schedule_untagged_serde() {
        assert_eq!(
            serde_json::from_str::<Schedule>("1700000000000").unwrap(),
            Schedule::At(1_700_000_000_000)
        );
        assert_eq!(
            serde_json::from_str::<Schedule>("\"0 0 12 * * ?\"").unwrap(),
            Schedule::Cron("0 0 12 * * ?".to_string())
        );
    }
}
