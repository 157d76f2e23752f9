use serde::{Deserialize, Serialize};

/// A named, ordered step of the enrichment pipeline.
///
/// Stages run in declaration order while the item is `Running`; on success
/// the item advances to the next stage, and success of [`Stage::Notification`]
/// completes the item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Locate the product page record and seed the pipeline.
    Discovery,
    /// Acquire product imagery.
    ImageFetch,
    /// Vision-model analysis of the acquired images.
    Enrichment,
    /// Map extracted facts onto the canonical schema.
    DataMapping,
    /// Compute scores from mapped data.
    Scoring,
    /// Publish to the search index.
    Indexing,
    /// Notify downstream consumers.
    Notification,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Self; 7] = [
        Self::Discovery,
        Self::ImageFetch,
        Self::Enrichment,
        Self::DataMapping,
        Self::Scoring,
        Self::Indexing,
        Self::Notification,
    ];

    /// Number of stages in the pipeline.
    pub const COUNT: usize = Self::ALL.len();

    /// Zero-based position of this stage in the pipeline.
    #[must_use]
    pub fn ordinal(self) -> usize {
        Self::ALL
            .iter()
            .position(|s| *s == self)
            .unwrap_or_default()
    }

    /// The stage that follows this one, or `None` for the final stage.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.ordinal() + 1).copied()
    }

    /// Whether this is the final pipeline stage.
    #[must_use]
    pub fn is_final(self) -> bool {
        self.next().is_none()
    }

    /// Return the snake_case wire form of the stage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::ImageFetch => "image_fetch",
            Self::Enrichment => "enrichment",
            Self::DataMapping => "data_mapping",
            Self::Scoring => "scoring",
            Self::Indexing => "indexing",
            Self::Notification => "notification",
        }
    }

    /// Parse the snake_case wire form back into a stage.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == s)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fraction of the pipeline completed, given the number of stages whose
/// output has been recorded. Used for the progress figure preserved on
/// quota exhaustion.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn progress_percentage(completed_stages: usize) -> f64 {
    (completed_stages.min(Stage::COUNT) as f64 / Stage::COUNT as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_pipeline() {
        assert_eq!(Stage::Discovery.ordinal(), 0);
        assert_eq!(Stage::Notification.ordinal(), 6);
        assert_eq!(Stage::Discovery.next(), Some(Stage::ImageFetch));
        assert_eq!(Stage::Indexing.next(), Some(Stage::Notification));
        assert_eq!(Stage::Notification.next(), None);
        assert!(Stage::Notification.is_final());
        assert!(!Stage::Scoring.is_final());
    }

    #[test]
    fn wire_form_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("unknown"), None);
    }

    #[test]
    fn progress_fraction() {
        assert!((progress_percentage(0) - 0.0).abs() < f64::EPSILON);
        // Two stages done out of seven: the "~28%" preserved on quota
        // exhaustion after DISCOVERY and IMAGE_FETCH.
        let two = progress_percentage(2);
        assert!((two - 28.571_428_571_428_573).abs() < 1e-9);
        assert!((progress_percentage(7) - 100.0).abs() < f64::EPSILON);
        assert!((progress_percentage(12) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn serde_snake_case() {
        let json = serde_json::to_string(&Stage::ImageFetch).unwrap();
        assert_eq!(json, "\"image_fetch\"");
        let back: Stage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Stage::ImageFetch);
    }
}
