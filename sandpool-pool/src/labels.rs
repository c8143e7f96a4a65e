// Copyright 2025 The Sandpool Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt;
use core::str::FromStr;
use std::collections::HashMap;

use sandpool_error::{Error, make_input_err};

use crate::engine::ContainerInfo;

pub const MANAGED_BY_LABEL: &str = "sandpool.managed-by";
pub const MANAGED_BY_VALUE: &str = "sandpool";
pub const TASK_LABEL: &str = "sandpool.task";
pub const SUBTYPE_LABEL: &str = "sandpool.subtype";
pub const EXCLUSIVE_LABEL: &str = "sandpool.exclusive";
/// Comma separated ids of containers deleted together with this one.
pub const DEPENDS_ON_LABEL: &str = "sandpool.depends-on";

/// Labels every managed container carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLabels {
    pub task: String,
    pub subtype: String,
    pub exclusive: bool,
    pub depends_on: Vec<String>,
}

impl ContainerLabels {
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut labels = HashMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (TASK_LABEL.to_string(), self.task.clone()),
            (SUBTYPE_LABEL.to_string(), self.subtype.clone()),
            (EXCLUSIVE_LABEL.to_string(), self.exclusive.to_string()),
        ]);
        if !self.depends_on.is_empty() {
            labels.insert(DEPENDS_ON_LABEL.to_string(), self.depends_on.join(","));
        }
        labels
    }

    /// Returns `None` for containers this pool does not manage.
    pub fn from_map(labels: &HashMap<String, String>) -> Option<Self> {
        if labels.get(MANAGED_BY_LABEL).map(String::as_str) != Some(MANAGED_BY_VALUE) {
            return None;
        }
        Some(Self {
            task: labels.get(TASK_LABEL)?.clone(),
            subtype: labels.get(SUBTYPE_LABEL)?.clone(),
            exclusive: labels.get(EXCLUSIVE_LABEL).is_some_and(|v| v == "true"),
            depends_on: labels
                .get(DEPENDS_ON_LABEL)
                .map(|deps| {
                    deps.split(',')
                        .map(str::trim)
                        .filter(|dep| !dep.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
        }
    }
}

impl FromStr for ContainerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => return Err(make_input_err!("Unknown container status {other}")),
        })
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health check state. `None` means the image has no health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
    None,
}

impl HealthState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::None => "none",
        }
    }

    /// Parses the human readable status column of a container listing,
    /// e.g. `Up 3 minutes (health: starting)`.
    pub fn from_status_text(status: &str) -> Self {
        if status.contains("(unhealthy)") {
            Self::Unhealthy
        } else if status.contains("(healthy)") {
            Self::Healthy
        } else if status.contains("(health: starting)") {
            Self::Starting
        } else {
            Self::None
        }
    }
}

impl FromStr for HealthState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "starting" => Self::Starting,
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            "none" | "" => Self::None,
            other => return Err(make_input_err!("Unknown health state {other}")),
        })
    }
}

/// Typed container query. Label constraints are ANDed, values within one
/// of the list constraints are ORed, mirroring engine filter semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    labels: Vec<(String, String)>,
    ids: Vec<String>,
    statuses: Vec<ContainerStatus>,
    health: Vec<HealthState>,
    network: Option<String>,
}

impl ContainerFilter {
    /// Containers managed by this pool for `task`.
    pub fn managed(task: &str) -> Self {
        Self::default()
            .label(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
            .label(TASK_LABEL, task)
    }

    #[must_use]
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn subtype(self, subtype: &str) -> Self {
        self.label(SUBTYPE_LABEL, subtype)
    }

    #[must_use]
    pub fn exclusive(self, exclusive: bool) -> Self {
        self.label(EXCLUSIVE_LABEL, if exclusive { "true" } else { "false" })
    }

    #[must_use]
    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.ids.extend(ids.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn status(mut self, status: ContainerStatus) -> Self {
        self.statuses.push(status);
        self
    }

    #[must_use]
    pub fn health(mut self, health: &[HealthState]) -> Self {
        self.health.extend_from_slice(health);
        self
    }

    #[must_use]
    pub fn network(mut self, network: &str) -> Self {
        self.network = Some(network.to_string());
        self
    }

    /// Engine API filter map.
    pub fn to_docker_filters(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        if !self.labels.is_empty() {
            filters.insert(
                "label".to_string(),
                self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            );
        }
        if !self.ids.is_empty() {
            filters.insert("id".to_string(), self.ids.clone());
        }
        if !self.statuses.is_empty() {
            filters.insert(
                "status".to_string(),
                self.statuses.iter().map(|s| s.as_str().to_string()).collect(),
            );
        }
        if !self.health.is_empty() {
            filters.insert(
                "health".to_string(),
                self.health.iter().map(|h| h.as_str().to_string()).collect(),
            );
        }
        if let Some(network) = &self.network {
            filters.insert("network".to_string(), vec![network.clone()]);
        }
        filters
    }

    /// Applies the filter locally. Used where the engine cannot filter.
    pub fn matches(&self, info: &ContainerInfo) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| info.labels.get(k) == Some(v))
            && (self.ids.is_empty() || self.ids.iter().any(|id| *id == info.id))
            && (self.statuses.is_empty() || self.statuses.contains(&info.status))
            && (self.health.is_empty() || self.health.contains(&info.health))
            && self
                .network
                .as_ref()
                .is_none_or(|network| info.networks.contains_key(network))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn labels() -> ContainerLabels {
        ContainerLabels {
            task: "shell".to_string(),
            subtype: "web_app".to_string(),
            exclusive: false,
            depends_on: vec!["db1".to_string(), "cache2".to_string()],
        }
    }

    #[test]
    fn labels_round_trip_through_map() {
        let map = labels().to_map();
        assert_eq!(map[DEPENDS_ON_LABEL], "db1,cache2");
        assert_eq!(map[EXCLUSIVE_LABEL], "false");
        assert_eq!(ContainerLabels::from_map(&map), Some(labels()));
    }

    #[test]
    fn unmanaged_labels_are_ignored() {
        let mut map = labels().to_map();
        map.remove(MANAGED_BY_LABEL);
        assert_eq!(ContainerLabels::from_map(&map), None);
    }

    #[test]
    fn docker_filters_only_include_set_constraints() {
        let filters = ContainerFilter::managed("shell")
            .subtype("web_app")
            .exclusive(false)
            .status(ContainerStatus::Running)
            .health(&[HealthState::Starting, HealthState::Healthy, HealthState::None])
            .network("net")
            .to_docker_filters();
        assert_eq!(
            filters["label"],
            vec![
                "sandpool.managed-by=sandpool",
                "sandpool.task=shell",
                "sandpool.subtype=web_app",
                "sandpool.exclusive=false",
            ]
        );
        assert_eq!(filters["status"], vec!["running"]);
        assert_eq!(filters["health"], vec!["starting", "healthy", "none"]);
        assert_eq!(filters["network"], vec!["net"]);
        assert!(!filters.contains_key("id"));
    }

    #[test]
    fn health_parses_status_text() {
        assert_eq!(HealthState::from_status_text("Up 2 minutes (healthy)"), HealthState::Healthy);
        assert_eq!(
            HealthState::from_status_text("Up 5 seconds (health: starting)"),
            HealthState::Starting
        );
        assert_eq!(HealthState::from_status_text("Up 1 hour (unhealthy)"), HealthState::Unhealthy);
        assert_eq!(HealthState::from_status_text("Up 1 hour"), HealthState::None);
    }
}
