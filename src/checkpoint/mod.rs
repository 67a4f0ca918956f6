//! Checkpoint policy: how much autonomy the loop has before it must pause.
//!
//! A [`CheckpointPolicy`] maps every [`CheckpointId`] to an enabled flag and
//! records the [`PolicyPreset`] that produced those flags. Presets other than
//! `custom` fully determine the flags, so a stored policy can always be
//! checked for consistency with [`CheckpointPolicy::check_consistency`].
//!
//! | Preset             | Enabled checkpoints                                          |
//! |--------------------|--------------------------------------------------------------|
//! | `manual`           | all                                                          |
//! | `balanced`         | `after_verification`, `before_next_story`, `before_next_epic`|
//! | `story_autonomous` | `before_next_story`                                          |
//! | `epic_autonomous`  | `before_next_epic` (granularity forced to `epic`)            |
//! | `custom`           | explicit set                                                 |
//!
//! # Granularity override
//!
//! With [`Granularity::Epic`] every within-story checkpoint reports disabled
//! from [`CheckpointPolicy::is_enabled`] no matter what its flag says. Only
//! `before_next_epic` is ever honored. The flags themselves are left as
//! configured so that switching back to `step` granularity restores them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A named suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointId {
    /// Before a batch of tasks is dispatched.
    BeforeTask,
    /// After a review verdict is recorded, before the loop acts on it.
    AfterVerification,
    /// Before the commit that closes a story.
    BeforeCommit,
    /// Before entering the next story of an epic.
    BeforeNextStory,
    /// Before entering the next epic of a feature.
    BeforeNextEpic,
}

impl CheckpointId {
    pub const ALL: [CheckpointId; 5] = [
        Self::BeforeTask,
        Self::AfterVerification,
        Self::BeforeCommit,
        Self::BeforeNextStory,
        Self::BeforeNextEpic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeTask => "before_task",
            Self::AfterVerification => "after_verification",
            Self::BeforeCommit => "before_commit",
            Self::BeforeNextStory => "before_next_story",
            Self::BeforeNextEpic => "before_next_epic",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::BeforeTask => "before starting a task",
            Self::AfterVerification => "after verification",
            Self::BeforeCommit => "before committing progress",
            Self::BeforeNextStory => "before advancing to the next story",
            Self::BeforeNextEpic => "before advancing to the next epic",
        }
    }

    /// Whether this checkpoint lives inside a story (as opposed to the epic boundary).
    pub fn is_within_story(&self) -> bool {
        !matches!(self, Self::BeforeNextEpic)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for CheckpointId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        CheckpointId::ALL
            .iter()
            .copied()
            .find(|c| c.name() == normalized)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown checkpoint '{}'. Valid values: {}",
                    s,
                    CheckpointId::ALL.map(|c| c.name()).join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyPreset {
    #[default]
    Manual,
    Balanced,
    StoryAutonomous,
    EpicAutonomous,
    Custom,
}

impl PolicyPreset {
    /// Flags determined by this preset, or `None` for `custom`.
    pub fn enabled_set(&self) -> Option<&'static [CheckpointId]> {
        match self {
            Self::Manual => Some(&CheckpointId::ALL),
            Self::Balanced => Some(&[
                CheckpointId::AfterVerification,
                CheckpointId::BeforeNextStory,
                CheckpointId::BeforeNextEpic,
            ]),
            Self::StoryAutonomous => Some(&[CheckpointId::BeforeNextStory]),
            Self::EpicAutonomous => Some(&[CheckpointId::BeforeNextEpic]),
            Self::Custom => None,
        }
    }

    /// Granularity implied by the preset.
    pub fn granularity(&self) -> Option<Granularity> {
        match self {
            Self::EpicAutonomous => Some(Granularity::Epic),
            Self::Custom => None,
            _ => Some(Granularity::Step),
        }
    }
}

impl fmt::Display for PolicyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyPreset::Manual => write!(f, "manual"),
            PolicyPreset::Balanced => write!(f, "balanced"),
            PolicyPreset::StoryAutonomous => write!(f, "story_autonomous"),
            PolicyPreset::EpicAutonomous => write!(f, "epic_autonomous"),
            PolicyPreset::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for PolicyPreset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "manual" => Ok(PolicyPreset::Manual),
            "balanced" => Ok(PolicyPreset::Balanced),
            "story_autonomous" | "story" => Ok(PolicyPreset::StoryAutonomous),
            "epic_autonomous" | "epic" => Ok(PolicyPreset::EpicAutonomous),
            "custom" => Ok(PolicyPreset::Custom),
            _ => anyhow::bail!(
                "Invalid policy preset '{}'. Valid values: manual, balanced, story_autonomous, epic_autonomous, custom",
                s
            ),
        }
    }
}

/// Level at which the operator wants to be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Every enabled checkpoint is honored.
    #[default]
    Step,
    /// Only the epic boundary is honored.
    Epic,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Step => write!(f, "step"),
            Granularity::Epic => write!(f, "epic"),
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "step" => Ok(Granularity::Step),
            "epic" => Ok(Granularity::Epic),
            _ => anyhow::bail!("Invalid granularity '{}'. Valid values: step, epic", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    pub preset: PolicyPreset,
    #[serde(default)]
    pub granularity: Granularity,
    pub checkpoints: BTreeMap<CheckpointId, bool>,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::from_preset(PolicyPreset::Manual)
    }
}

impl CheckpointPolicy {
    /// Build a policy from a named preset. `custom` starts with everything disabled.
    pub fn from_preset(preset: PolicyPreset) -> Self {
        let enabled = preset.enabled_set().unwrap_or(&[]);
        let checkpoints = CheckpointId::ALL
            .iter()
            .map(|c| (*c, enabled.contains(c)))
            .collect();
        Self {
            preset,
            granularity: preset.granularity().unwrap_or_default(),
            checkpoints,
        }
    }

    /// Build a custom policy with an explicit enabled set.
    pub fn custom(enabled: &[CheckpointId], granularity: Granularity) -> Self {
        let checkpoints = CheckpointId::ALL
            .iter()
            .map(|c| (*c, enabled.contains(c)))
            .collect();
        Self {
            preset: PolicyPreset::Custom,
            granularity,
            checkpoints,
        }
    }

    /// Raw flag, ignoring the granularity override.
    pub fn flag(&self, checkpoint: CheckpointId) -> bool {
        self.checkpoints.get(&checkpoint).copied().unwrap_or(false)
    }

    /// Whether the loop must suspend at `checkpoint`.
    pub fn is_enabled(&self, checkpoint: CheckpointId) -> bool {
        if self.granularity == Granularity::Epic && checkpoint.is_within_story() {
            return false;
        }
        self.flag(checkpoint)
    }

    /// Whether every checkpoint is effectively disabled.
    pub fn suppresses_all(&self) -> bool {
        CheckpointId::ALL.iter().all(|c| !self.is_enabled(*c))
    }

    /// Describe the first inconsistency between flags and preset, if any.
    pub fn check_consistency(&self) -> Result<(), String> {
        for checkpoint in CheckpointId::ALL {
            if !self.checkpoints.contains_key(&checkpoint) {
                return Err(format!("checkpoint '{}' has no flag", checkpoint));
            }
        }
        if let Some(enabled) = self.preset.enabled_set() {
            for checkpoint in CheckpointId::ALL {
                let expected = enabled.contains(&checkpoint);
                if self.flag(checkpoint) != expected {
                    return Err(format!(
                        "preset '{}' requires '{}' to be {}",
                        self.preset,
                        checkpoint,
                        if expected { "enabled" } else { "disabled" }
                    ));
                }
            }
        }
        if let Some(granularity) = self.preset.granularity()
            && granularity != self.granularity
        {
            return Err(format!(
                "preset '{}' requires granularity '{}', found '{}'",
                self.preset, granularity, self.granularity
            ));
        }
        Ok(())
    }
}
