//! Resource usage snapshots, ceilings, and quota breach detection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// A tracked resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    /// Resident memory in MB.
    Memory,
    /// CPU in cores.
    Cpu,
    /// Wall-clock time in seconds.
    Time,
    /// Model tokens consumed.
    Tokens,
    /// Network traffic in MB.
    Network,
    /// File operations performed.
    FileOps,
}

impl ResourceKind {
    /// Order in which dimensions are checked; the first breached one is reported.
    pub const CHECK_ORDER: [ResourceKind; 6] = [
        ResourceKind::Memory,
        ResourceKind::Cpu,
        ResourceKind::Time,
        ResourceKind::Tokens,
        ResourceKind::Network,
        ResourceKind::FileOps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Time => "time",
            Self::Tokens => "tokens",
            Self::Network => "network",
            Self::FileOps => "fileOps",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::CHECK_ORDER
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownResource(s.to_string()))
    }
}

/// Current consumption of every tracked resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub memory: f64,
    pub cpu: f64,
    pub time: f64,
    pub tokens: f64,
    pub network: f64,
    pub file_ops: f64,
}

impl ResourceUsage {
    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Memory => self.memory,
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Time => self.time,
            ResourceKind::Tokens => self.tokens,
            ResourceKind::Network => self.network,
            ResourceKind::FileOps => self.file_ops,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, value: f64) {
        match kind {
            ResourceKind::Memory => self.memory = value,
            ResourceKind::Cpu => self.cpu = value,
            ResourceKind::Time => self.time = value,
            ResourceKind::Tokens => self.tokens = value,
            ResourceKind::Network => self.network = value,
            ResourceKind::FileOps => self.file_ops = value,
        }
    }

    /// Overwrite the dimensions present in `update`, leaving the rest untouched.
    pub fn merge(&mut self, update: &UsageUpdate) {
        for kind in ResourceKind::CHECK_ORDER {
            if let Some(value) = update.get(kind) {
                self.set(kind, value);
            }
        }
    }
}

/// A partial usage update; `None` leaves the dimension unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ops: Option<f64>,
}

impl UsageUpdate {
    pub fn get(&self, kind: ResourceKind) -> Option<f64> {
        match kind {
            ResourceKind::Memory => self.memory,
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Time => self.time,
            ResourceKind::Tokens => self.tokens,
            ResourceKind::Network => self.network,
            ResourceKind::FileOps => self.file_ops,
        }
    }

    /// Builder method to set a single dimension.
    pub fn with(mut self, kind: ResourceKind, value: f64) -> Self {
        let slot = match kind {
            ResourceKind::Memory => &mut self.memory,
            ResourceKind::Cpu => &mut self.cpu,
            ResourceKind::Time => &mut self.time,
            ResourceKind::Tokens => &mut self.tokens,
            ResourceKind::Network => &mut self.network,
            ResourceKind::FileOps => &mut self.file_ops,
        };
        *slot = Some(value);
        self
    }
}

/// Static ceilings per resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// MB.
    pub max_memory: f64,
    /// Cores.
    pub max_cpu: f64,
    /// Seconds.
    pub max_time: f64,
    pub max_tokens: f64,
    /// MB.
    pub max_network: f64,
    pub max_file_ops: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory: 200.0,
            max_cpu: 2.0,
            max_time: 30.0 * 60.0,
            max_tokens: 10_000.0,
            max_network: 100.0,
            max_file_ops: 1_000.0,
        }
    }
}

impl ResourceLimits {
    pub fn limit(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Memory => self.max_memory,
            ResourceKind::Cpu => self.max_cpu,
            ResourceKind::Time => self.max_time,
            ResourceKind::Tokens => self.max_tokens,
            ResourceKind::Network => self.max_network,
            ResourceKind::FileOps => self.max_file_ops,
        }
    }

    /// First dimension (in [`ResourceKind::CHECK_ORDER`]) whose value exceeds its ceiling.
    pub fn first_breach(&self, usage: &ResourceUsage) -> Option<QuotaBreach> {
        ResourceKind::CHECK_ORDER.into_iter().find_map(|kind| {
            let current = usage.get(kind);
            let limit = self.limit(kind);
            (current > limit).then_some(QuotaBreach {
                resource: kind,
                current,
                limit,
            })
        })
    }
}

/// A measured value that exceeded its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaBreach {
    pub resource: ResourceKind,
    pub current: f64,
    pub limit: f64,
}

impl fmt::Display for QuotaBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} quota exceeded: {:.2} > {:.2}",
            self.resource, self.current, self.limit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_only_touches_present_fields() {
        let mut usage = ResourceUsage {
            memory: 10.0,
            tokens: 5.0,
            ..Default::default()
        };
        usage.merge(&UsageUpdate::default().with(ResourceKind::Tokens, 42.0));
        assert_eq!(usage.memory, 10.0);
        assert_eq!(usage.tokens, 42.0);
    }

    #[test]
    fn test_no_breach_at_ceiling() {
        let limits = ResourceLimits::default();
        let usage = ResourceUsage {
            memory: limits.max_memory,
            ..Default::default()
        };
        assert_eq!(limits.first_breach(&usage), None);
    }

    #[test]
    fn test_first_breach_follows_check_order() {
        let limits = ResourceLimits::default();
        let usage = ResourceUsage {
            file_ops: 5_000.0,
            cpu: 3.0,
            tokens: 20_000.0,
            ..Default::default()
        };
        let breach = limits.first_breach(&usage).unwrap();
        assert_eq!(breach.resource, ResourceKind::Cpu);
        assert_eq!(breach.current, 3.0);
        assert_eq!(breach.limit, 2.0);
    }

    #[test]
    fn test_parse_resource_kind() {
        assert_eq!("fileOps".parse::<ResourceKind>().unwrap(), ResourceKind::FileOps);
        assert_eq!("MEMORY".parse::<ResourceKind>().unwrap(), ResourceKind::Memory);
        assert!("disk".parse::<ResourceKind>().is_err());
    }
}
