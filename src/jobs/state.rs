//! Job stage state machine.

use serde::{Deserialize, Serialize};

/// Stage of a job in its processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Created, no work started yet. The only cancellable stage.
    Pending,
    /// Pulling source material together.
    Extract,
    /// Understanding the material.
    Analyze,
    /// Calling the generation service.
    Generate,
    /// Writing results into the session.
    Finalize,
    /// Finished successfully.
    Completed,
    /// Failed or cancelled.
    Failed,
}

impl JobStage {
    /// The working stages in pipeline order.
    pub const WORKING: [JobStage; 4] = [
        JobStage::Extract,
        JobStage::Analyze,
        JobStage::Generate,
        JobStage::Finalize,
    ];

    /// The forward successor along the pipeline, if any.
    pub fn next(&self) -> Option<JobStage> {
        use JobStage::*;

        match self {
            Pending => Some(Extract),
            Extract => Some(Analyze),
            Analyze => Some(Generate),
            Generate => Some(Finalize),
            Finalize => Some(Completed),
            Completed | Failed => None,
        }
    }

    /// Check if this stage allows transitioning to another stage.
    pub fn can_transition_to(&self, target: JobStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == JobStage::Failed || self.next() == Some(target)
    }

    /// Check if this is a terminal stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extract => "extract",
            Self::Analyze => "analyze",
            Self::Generate => "generate",
            Self::Finalize => "finalize",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "extract" => Ok(Self::Extract),
            "analyze" => Ok(Self::Analyze),
            "generate" => Ok(Self::Generate),
            "finalize" => Ok(Self::Finalize),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown job stage: {}", s)),
        }
    }
}
