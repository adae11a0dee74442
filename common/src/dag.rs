use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{EngineError, Result};
use crate::job::{StageId, StageKind, StageSpec};

/// Validates a stage DAG and returns the stages in a topological order.
///
/// Rejected with `InvalidJob`:
/// - empty stage list or duplicate stage ids
/// - upstream references to unknown stages
/// - cycles
/// - map stages with upstreams (map reads the job input, not a shuffle)
/// - reduce stages without upstreams
pub fn validate(stages: &[StageSpec]) -> Result<Vec<StageId>> {
    if stages.is_empty() {
        return Err(EngineError::InvalidJob("job has no stages".to_string()));
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for stage in stages {
        if !ids.insert(stage.id.as_str()) {
            return Err(EngineError::InvalidJob(format!(
                "duplicate stage id '{}'",
                stage.id
            )));
        }
    }

    for stage in stages {
        for up in &stage.upstream {
            if !ids.contains(up.as_str()) {
                return Err(EngineError::InvalidJob(format!(
                    "stage '{}' references unknown upstream '{}'",
                    stage.id, up
                )));
            }
        }
        match &stage.kind {
            StageKind::Map { .. } if !stage.upstream.is_empty() => {
                return Err(EngineError::InvalidJob(format!(
                    "map stage '{}' cannot have upstream stages",
                    stage.id
                )));
            }
            StageKind::Reduce { .. } if stage.upstream.is_empty() => {
                return Err(EngineError::InvalidJob(format!(
                    "reduce stage '{}' has no upstream stage",
                    stage.id
                )));
            }
            _ => {}
        }
    }

    // Kahn's algorithm; anything left over is on a cycle.
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();

    for stage in stages {
        indegree.entry(stage.id.as_str()).or_insert(0);
        for up in &stage.upstream {
            *indegree.entry(stage.id.as_str()).or_insert(0) += 1;
            downstream
                .entry(up.as_str())
                .or_default()
                .push(stage.id.as_str());
        }
    }

    let mut ready: VecDeque<&str> = stages
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| indegree[id] == 0)
        .collect();
    let mut order: Vec<StageId> = Vec::with_capacity(stages.len());

    while let Some(id) = ready.pop_front() {
        order.push(id.to_string());
        if let Some(next) = downstream.get(id) {
            for n in next {
                let d = indegree.get_mut(n).expect("known stage");
                *d -= 1;
                if *d == 0 {
                    ready.push_back(n);
                }
            }
        }
    }

    if order.len() != stages.len() {
        return Err(EngineError::InvalidJob("stage DAG has a cycle".to_string()));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{MapFn, ReduceFn};

    fn map_stage(id: &str) -> StageSpec {
        StageSpec {
            id: id.to_string(),
            kind: StageKind::Map {
                function: MapFn::TokenizeCount,
            },
            upstream: vec![],
        }
    }

    fn reduce_stage(id: &str, upstream: &[&str]) -> StageSpec {
        StageSpec {
            id: id.to_string(),
            kind: StageKind::Reduce {
                function: ReduceFn::SumByKey,
            },
            upstream: upstream.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn accepts_map_reduce_chain_in_topo_order() {
        let stages = vec![reduce_stage("agg", &["tokenize"]), map_stage("tokenize")];
        let order = validate(&stages).unwrap();
        assert_eq!(order, vec!["tokenize".to_string(), "agg".to_string()]);
    }

    #[test]
    fn rejects_empty_job() {
        let err = validate(&[]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidJob(_)));
    }

    #[test]
    fn rejects_unknown_upstream() {
        let stages = vec![map_stage("m"), reduce_stage("r", &["nope"])];
        let err = validate(&stages).unwrap_err();
        assert!(matches!(err, EngineError::InvalidJob(_)));
        assert!(err.to_string().contains("unknown upstream"));
    }

    #[test]
    fn rejects_cycle() {
        let stages = vec![reduce_stage("a", &["b"]), reduce_stage("b", &["a"])];
        let err = validate(&stages).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_duplicate_stage_ids() {
        let stages = vec![map_stage("m"), map_stage("m")];
        let err = validate(&stages).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_reduce_without_upstream() {
        let stages = vec![reduce_stage("r", &[])];
        let err = validate(&stages).unwrap_err();
        assert!(err.to_string().contains("no upstream"));
    }

    #[test]
    fn rejects_map_with_upstream() {
        let mut m = map_stage("m2");
        m.upstream = vec!["m1".to_string()];
        let stages = vec![map_stage("m1"), m];
        let err = validate(&stages).unwrap_err();
        assert!(err.to_string().contains("cannot have upstream"));
    }
}
