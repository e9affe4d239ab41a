//! Grouping of an ordered stage list into execution groups.
//!
//! A single left-to-right pass: adjacent parallel-marked stages coalesce
//! into one parallel group; every sequential stage closes any open group
//! and forms its own singleton. Groups execute strictly in order; within
//! a parallel group there are no intra-group ordering guarantees.

use crate::definition::PipelineStage;

/// One unit of execution: a singleton sequential stage or a set of
/// adjacent parallel stages.
#[derive(Debug, Clone)]
pub struct StageGroup {
    pub parallel: bool,
    pub stages: Vec<PipelineStage>,
}

/// Group an ordered stage list into a sequence of execution groups.
pub fn group_stages(stages: &[PipelineStage]) -> Vec<StageGroup> {
    let mut groups: Vec<StageGroup> = Vec::new();

    for stage in stages {
        if stage.parallel {
            match groups.last_mut() {
                Some(group) if group.parallel => group.stages.push(stage.clone()),
                _ => groups.push(StageGroup {
                    parallel: true,
                    stages: vec![stage.clone()],
                }),
            }
        } else {
            groups.push(StageGroup {
                parallel: false,
                stages: vec![stage.clone()],
            });
        }
    }

    groups
}
