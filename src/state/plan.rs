//! Plan files: the external planning step's hand-off format.
//!
//! ```json
//! { "features": [ { "id": "F1", "description": "...", "epics": [
//!     { "id": "E1", "title": "...", "stories": [
//!         { "id": "S1", "title": "...", "scope": ["src/auth/"],
//!           "tasks": [ { "id": "T1", "description": "...", "depends_on": [] } ] } ] } ] } ] }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use super::model::{Epic, Feature, LoopStatus, Snapshot, Story, Task};
use super::transition::{Op, Transition};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub features: Vec<PlanFeature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFeature {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub epics: Vec<PlanEpic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEpic {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub stories: Vec<PlanStory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Hex-encoded SHA-256 of the plan content, truncated to 12 characters.
pub fn compute_plan_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    format!("{:x}", result)[..12].to_string()
}

impl PlanFile {
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse plan JSON")
    }

    /// Read a plan file, returning it together with its content hash.
    pub fn load(path: &Path) -> Result<(Self, String)> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file {}", path.display()))?;
        let plan = Self::parse(&content)
            .with_context(|| format!("Invalid plan file {}", path.display()))?;
        Ok((plan, compute_plan_hash(&content)))
    }

    /// Build the model tree with parent ids filled in.
    pub fn to_features(&self) -> Vec<Feature> {
        self.features
            .iter()
            .map(|pf| {
                let mut feature = Feature::new(&pf.id, &pf.description);
                feature.epics = pf
                    .epics
                    .iter()
                    .map(|pe| {
                        let mut epic = Epic::new(&pe.id, &pf.id, &pe.title);
                        epic.stories = pe
                            .stories
                            .iter()
                            .map(|ps| {
                                let mut story = Story::new(&ps.id, &pe.id, &ps.title);
                                story.scope = ps.scope.clone();
                                story.tasks = ps
                                    .tasks
                                    .iter()
                                    .map(|pt| {
                                        Task::new(
                                            &pt.id,
                                            &ps.id,
                                            &pt.description,
                                            pt.depends_on.clone(),
                                        )
                                    })
                                    .collect();
                                story
                            })
                            .collect();
                        epic
                    })
                    .collect();
                feature
            })
            .collect()
    }

    /// Transition importing every feature of this plan. The first imported
    /// feature is activated when nothing is active yet.
    pub fn import_transition(&self, current: &Snapshot, hash: &str) -> Transition {
        let features = self.to_features();
        let activate = if current.active_feature().is_none() {
            features.first().map(|f| f.id.clone())
        } else {
            None
        };
        let mut transition = Transition::new(format!("import plan {}", hash));
        transition.extend(
            features
                .into_iter()
                .map(|feature| Op::ImportFeature { feature }),
        );
        if let Some(feature_id) = activate {
            transition.push(Op::ActivateFeature { feature_id });
        }
        if current.loop_record.status == LoopStatus::Complete {
            transition.push(Op::SetLoopStatus {
                status: LoopStatus::Idle,
            });
        }
        transition
    }
}
