//! Diverter node health.
//!
//! Paths are validated against the health of every diverter they touch. A
//! diverter that has never reported is assumed healthy.

use crate::path::SwitchingPath;
use crate::DiverterId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Result of validating one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathHealth {
    /// True when no segment touches an unhealthy diverter.
    pub healthy: bool,
    /// Unhealthy diverters on the path, in segment order, without repeats.
    pub unhealthy_node_ids: Vec<DiverterId>,
}

/// Checks generated paths against diverter health.
pub trait NodeHealthChecker: Send + Sync {
    /// Validate every segment of `path`.
    fn validate_path(&self, path: &SwitchingPath) -> PathHealth;
}

/// Last reported health of one diverter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeHealth {
    /// Whether the diverter can be switched.
    pub healthy: bool,
    /// Last fault description, if any.
    pub reason: Option<String>,
    /// When this status was reported.
    pub updated_at: DateTime<Utc>,
}

/// In-memory [`NodeHealthChecker`] updated by hardware monitors.
#[derive(Default)]
pub struct NodeHealthRegistry {
    nodes: DashMap<DiverterId, NodeHealth>,
}

impl NodeHealthRegistry {
    /// Empty registry; every diverter is healthy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a diverter unhealthy.
    pub fn mark_unhealthy(&self, diverter_id: DiverterId, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(diverter_id = %diverter_id, reason = %reason, "diverter marked unhealthy");
        self.nodes.insert(
            diverter_id,
            NodeHealth {
                healthy: false,
                reason: Some(reason),
                updated_at: Utc::now(),
            },
        );
    }

    /// Mark a diverter healthy again.
    pub fn mark_healthy(&self, diverter_id: DiverterId) {
        tracing::info!(diverter_id = %diverter_id, "diverter healthy");
        self.nodes.insert(
            diverter_id,
            NodeHealth {
                healthy: true,
                reason: None,
                updated_at: Utc::now(),
            },
        );
    }

    /// Last reported status of `diverter_id`.
    pub fn get(&self, diverter_id: DiverterId) -> Option<NodeHealth> {
        self.nodes.get(&diverter_id).map(|entry| entry.value().clone())
    }

    fn is_healthy(&self, diverter_id: DiverterId) -> bool {
        self.nodes
            .get(&diverter_id)
            .map_or(true, |entry| entry.healthy)
    }
}

impl NodeHealthChecker for NodeHealthRegistry {
    fn validate_path(&self, path: &SwitchingPath) -> PathHealth {
        let mut unhealthy_node_ids: Vec<DiverterId> = Vec::new();
        for segment in path.segments() {
            if !self.is_healthy(segment.diverter_id) && !unhealthy_node_ids.contains(&segment.diverter_id) {
                unhealthy_node_ids.push(segment.diverter_id);
            }
        }
        PathHealth {
            healthy: unhealthy_node_ids.is_empty(),
            unhealthy_node_ids,
        }
    }
}
