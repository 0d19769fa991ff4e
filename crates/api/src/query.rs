//! Query-string types for list endpoints.
//!
//! Multi-valued filters arrive comma-separated (`?ids=1,2&status=started`)
//! and are parsed into the repository search structs here.

use conduit_core::types::DbId;
use conduit_db::models::node::NodeSearch;
use conduit_db::models::schedule::ScheduleSearch;
use conduit_db::models::status::{NodeStatus, ScheduleStatus, StatusId, TaskStatus};
use conduit_db::models::task::TaskSearch;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// `GET /api/v1/tasks` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct TaskSearchParams {
    pub ids: Option<String>,
    pub group_key: Option<String>,
    pub status: Option<String>,
    pub schedule_id: Option<DbId>,
    pub limit: Option<i64>,
}

impl TaskSearchParams {
    pub fn into_search(self) -> AppResult<TaskSearch> {
        Ok(TaskSearch {
            ids: self.ids.as_deref().map(parse_ids).transpose()?,
            group_key: self.group_key,
            status_ids: self
                .status
                .as_deref()
                .map(|s| parse_statuses(s, "task", |n| TaskStatus::parse(n).map(TaskStatus::id)))
                .transpose()?,
            schedule_id: self.schedule_id,
            limit: self.limit,
        })
    }
}

/// `GET /api/v1/schedules` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ScheduleSearchParams {
    pub names: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

impl ScheduleSearchParams {
    pub fn into_search(self) -> AppResult<ScheduleSearch> {
        let status_id = match self.status.as_deref() {
            Some(name) => Some(
                ScheduleStatus::parse(name)
                    .ok_or_else(|| AppError::BadRequest(format!("Unknown schedule status '{name}'")))?
                    .id(),
            ),
            None => None,
        };
        Ok(ScheduleSearch {
            names: self.names.as_deref().map(|n| split_csv(n).map(String::from).collect()),
            status_id,
            limit: self.limit,
        })
    }
}

/// `GET /api/v1/fleet/nodes` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct NodeSearchParams {
    pub status: Option<String>,
    pub deployment_id: Option<DbId>,
}

impl NodeSearchParams {
    pub fn into_search(self) -> AppResult<NodeSearch> {
        Ok(NodeSearch {
            status_ids: self
                .status
                .as_deref()
                .map(|s| parse_statuses(s, "node", |n| NodeStatus::parse(n).map(NodeStatus::id)))
                .transpose()?,
            deployment_id: self.deployment_id,
        })
    }
}

/// `?limit=` for simple listings.
#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

fn split_csv(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_ids(raw: &str) -> AppResult<Vec<DbId>> {
    split_csv(raw)
        .map(|s| {
            s.parse::<DbId>()
                .map_err(|_| AppError::BadRequest(format!("Invalid id '{s}'")))
        })
        .collect()
}

fn parse_statuses(
    raw: &str,
    entity: &str,
    parse: impl Fn(&str) -> Option<StatusId>,
) -> AppResult<Vec<StatusId>> {
    split_csv(raw)
        .map(|s| {
            parse(s).ok_or_else(|| AppError::BadRequest(format!("Unknown {entity} status '{s}'")))
        })
        .collect()
}
