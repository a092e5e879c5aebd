use serde::{Deserialize, Serialize};

/// Outcome counts of one bundle group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupReport {
    pub name: String,
    /// Resources matched by the group's predicate.
    pub resources: usize,
    /// Resources redirected into an atlas.
    pub packed: usize,
    /// Resources passed through unpacked (alone in a pass or over the size limit).
    pub skipped: usize,
    /// Resources the orchestrator could not place even alone.
    pub unpackable: usize,
    /// Resources that failed to load or decode, or all of them when the group aborted.
    pub failed: usize,
    /// Atlases composited in this build.
    pub atlases_built: usize,
    /// Atlases reused from an earlier build.
    pub atlases_reused: usize,
    pub solver_invocations: usize,
    /// Set when the whole group aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GroupReport {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Aggregate report of one build.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuildReport {
    pub build_id: u32,
    pub groups: Vec<GroupReport>,
    /// Encoded bytes of every packed source.
    pub bytes_before: u64,
    /// Encoded bytes of the atlases those sources now point at.
    pub bytes_after: u64,
}

impl BuildReport {
    pub fn packed(&self) -> usize {
        self.groups.iter().map(|g| g.packed).sum()
    }
    pub fn skipped(&self) -> usize {
        self.groups.iter().map(|g| g.skipped + g.unpackable).sum()
    }
    pub fn failed(&self) -> usize {
        self.groups.iter().map(|g| g.failed).sum()
    }
    pub fn failed_groups(&self) -> usize {
        self.groups.iter().filter(|g| g.is_failed()).count()
    }
    pub fn atlases_built(&self) -> usize {
        self.groups.iter().map(|g| g.atlases_built).sum()
    }
    pub fn atlases_reused(&self) -> usize {
        self.groups.iter().map(|g| g.atlases_reused).sum()
    }

    /// `bytes_after / bytes_before`; 1.0 when nothing was packed.
    pub fn reduction_ratio(&self) -> f64 {
        if self.bytes_before > 0 {
            self.bytes_after as f64 / self.bytes_before as f64
        } else {
            1.0
        }
    }

    /// Returns a human-readable summary of the report.
    pub fn summary(&self) -> String {
        format!(
            "Build {}: Groups: {} ({} failed), Packed: {}, Skipped: {}, Failed: {}, Atlases: {} built / {} reused, Size: {} -> {} bytes ({:.2}%)",
            self.build_id,
            self.groups.len(),
            self.failed_groups(),
            self.packed(),
            self.skipped(),
            self.failed(),
            self.atlases_built(),
            self.atlases_reused(),
            self.bytes_before,
            self.bytes_after,
            self.reduction_ratio() * 100.0,
        )
    }
}
