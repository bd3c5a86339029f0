//! # Task Kinds
//!
//! The fixed set of stages a marketing-video run is built from, together with
//! the scheduling metadata each stage declares: default priority, the external
//! resource class it draws concurrency from, and which timeout profile wraps
//! its execution.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    CollectAssets,
    SelectPairs,
    GenerateSubclip,
    DownloadResult,
    GenerateAudio,
    CombineClips,
    MergeAudio,
    StoreFinal,
}

impl TaskKind {
    pub const ALL: [TaskKind; 8] = [
        TaskKind::CollectAssets,
        TaskKind::SelectPairs,
        TaskKind::GenerateSubclip,
        TaskKind::DownloadResult,
        TaskKind::GenerateAudio,
        TaskKind::CombineClips,
        TaskKind::MergeAudio,
        TaskKind::StoreFinal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CollectAssets => "collect-assets",
            Self::SelectPairs => "select-pairs",
            Self::GenerateSubclip => "generate-subclip",
            Self::DownloadResult => "download-result",
            Self::GenerateAudio => "generate-audio",
            Self::CombineClips => "combine-clips",
            Self::MergeAudio => "merge-audio",
            Self::StoreFinal => "store-final",
        }
    }

    /// Higher runs first among simultaneously ready tasks.
    ///
    /// Narration is slower to generate than a single subclip, so it is started
    /// ahead of the fan-out members that become ready at the same moment.
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::GenerateAudio => 20,
            Self::GenerateSubclip => 10,
            Self::DownloadResult => 5,
            _ => 0,
        }
    }

    pub fn resource_class(&self) -> ResourceClass {
        match self {
            Self::GenerateSubclip | Self::GenerateAudio => ResourceClass::Generation,
            Self::SelectPairs => ResourceClass::Interpretation,
            Self::CollectAssets | Self::DownloadResult | Self::StoreFinal => {
                ResourceClass::StorageIo
            }
            Self::CombineClips | Self::MergeAudio => ResourceClass::LocalMedia,
        }
    }

    pub fn timeout_profile(&self) -> TimeoutProfile {
        match self {
            Self::GenerateSubclip | Self::GenerateAudio => TimeoutProfile::Generation,
            Self::CombineClips | Self::MergeAudio => TimeoutProfile::LocalMedia,
            Self::CollectAssets | Self::SelectPairs | Self::DownloadResult | Self::StoreFinal => {
                TimeoutProfile::Metadata
            }
        }
    }

    /// Whether re-running the task body after an interrupted attempt is safe.
    ///
    /// Generation submits are billed per request, so an attempt that was cut
    /// off mid-flight only gets re-run while retry budget remains.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::GenerateSubclip | Self::GenerateAudio)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown task kind: {s}"))
    }
}

/// Named concurrency budget shared by one or more task kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Video and narration synthesis quota
    Generation,
    /// Prompt interpretation quota
    Interpretation,
    /// Object storage reads and writes
    StorageIo,
    /// Local combine/merge work
    LocalMedia,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [
        ResourceClass::Generation,
        ResourceClass::Interpretation,
        ResourceClass::StorageIo,
        ResourceClass::LocalMedia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Interpretation => "interpretation",
            Self::StorageIo => "storage_io",
            Self::LocalMedia => "local_media",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which configured timeout wraps a task attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutProfile {
    Metadata,
    Generation,
    LocalMedia,
}
