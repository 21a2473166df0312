//! Dependency batch planner
//!
//! Turns the rule dependency graph into an ordered list of layers. A rule's
//! layer is `1 + max(layer of its prerequisites)` (0 without prerequisites);
//! rules sharing a layer are mutually independent and form one [`Batch`].
//!
//! The graph is held as an arena: rule ids map to dense indices and edges are
//! index lists, which keeps layering a pair of flat loops and makes the
//! resulting plan cheap to cache.

use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// One dependency layer of mutually independent rules, ids sorted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub layer: usize,
    pub rule_ids: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rule_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_ids.is_empty()
    }
}

/// Batches in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
}

impl BatchPlan {
    pub fn rule_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Layer index of every planned rule
    pub fn layers(&self) -> HashMap<&str, usize> {
        self.batches
            .iter()
            .flat_map(|b| b.rule_ids.iter().map(move |id| (id.as_str(), b.layer)))
            .collect()
    }
}

struct Graph {
    ids: Vec<String>,
    prerequisites: Vec<Vec<usize>>,
}

impl Graph {
    /// Build the arena. Edges pointing outside `ids` are dropped: the plan is
    /// restricted to the requested rules.
    fn new(ids: &[String], edges: &BTreeMap<String, BTreeSet<String>>) -> Self {
        let mut ids: Vec<String> = ids.to_vec();
        ids.sort();
        ids.dedup();
        let index: HashMap<&str, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let prerequisites = ids
            .iter()
            .map(|id| {
                edges
                    .get(id)
                    .map(|deps| {
                        deps.iter()
                            .filter_map(|d| index.get(d.as_str()).copied())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        Self { ids, prerequisites }
    }

    /// Longest-path layering by repeated relaxation. An acyclic graph
    /// stabilizes within |rules| rounds; otherwise a cycle exists.
    fn layers(&self) -> Result<Vec<usize>, EngineError> {
        let n = self.ids.len();
        let mut layers = vec![0usize; n];

        for _ in 0..=n {
            let mut changed = false;
            for i in 0..n {
                let layer = self.prerequisites[i]
                    .iter()
                    .map(|&p| layers[p] + 1)
                    .max()
                    .unwrap_or(0);
                if layer != layers[i] {
                    layers[i] = layer;
                    changed = true;
                }
            }
            if !changed {
                return Ok(layers);
            }
        }

        let member = self.cycle_member().unwrap_or(0);
        let rule = self.ids[member].clone();
        Err(EngineError::configuration(
            rule,
            format!("dependency cycle detected: {}", self.cycle_path(member).join(" -> ")),
        ))
    }

    /// First rule (in id order) that lies on a cycle
    fn cycle_member(&self) -> Option<usize> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        let n = self.ids.len();
        let mut marks = vec![Mark::New; n];

        for start in 0..n {
            if marks[start] != Mark::New {
                continue;
            }
            // Iterative DFS over prerequisite edges: (node, next edge index)
            let mut stack = vec![(start, 0usize)];
            marks[start] = Mark::Active;
            while let Some(top) = stack.last_mut() {
                let (node, edge) = *top;
                if let Some(&next) = self.prerequisites[node].get(edge) {
                    top.1 += 1;
                    match marks[next] {
                        Mark::Active => return Some(next),
                        Mark::New => {
                            marks[next] = Mark::Active;
                            stack.push((next, 0));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        None
    }

    /// Walk prerequisites from a cycle member until it repeats
    fn cycle_path(&self, member: usize) -> Vec<String> {
        let mut path = vec![self.ids[member].clone()];
        let mut seen = BTreeSet::from([member]);
        let mut current = member;
        loop {
            let next = self.prerequisites[current]
                .iter()
                .copied()
                .find(|&p| p == member || self.reaches(p, member));
            match next {
                Some(next) => {
                    path.push(self.ids[next].clone());
                    if !seen.insert(next) {
                        return path;
                    }
                    current = next;
                }
                None => return path,
            }
        }
    }

    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut seen = vec![false; self.ids.len()];
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if std::mem::replace(&mut seen[node], true) {
                continue;
            }
            stack.extend(self.prerequisites[node].iter().copied());
        }
        false
    }
}

/// Compute the batch sequence for `ids` under `edges`
pub fn plan(
    ids: &[String],
    edges: &BTreeMap<String, BTreeSet<String>>,
) -> Result<BatchPlan, EngineError> {
    let graph = Graph::new(ids, edges);
    let layers = graph.layers()?;

    let depth = layers.iter().copied().max().map_or(0, |d| d + 1);
    let mut batches: Vec<Batch> = (0..depth)
        .map(|layer| Batch {
            layer,
            rule_ids: Vec::new(),
        })
        .collect();
    // graph.ids is sorted, so every batch comes out sorted
    for (i, id) in graph.ids.iter().enumerate() {
        batches[layers[i]].rule_ids.push(id.clone());
    }

    Ok(BatchPlan { batches })
}

/// Planner that memoizes plans by a hash of (rule-set, edges)
#[derive(Default)]
pub struct BatchPlanner {
    cache: Mutex<HashMap<u64, Arc<BatchPlan>>>,
}

impl BatchPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(
        &self,
        ids: &[String],
        edges: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<Arc<BatchPlan>, EngineError> {
        let key = Self::fingerprint(ids, edges);
        if let Some(plan) = self.lock().get(&key) {
            tracing::trace!("Reusing cached batch plan {:016x}", key);
            return Ok(plan.clone());
        }

        let plan = Arc::new(plan(ids, edges)?);
        self.lock().insert(key, plan.clone());
        Ok(plan)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<BatchPlan>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fingerprint(ids: &[String], edges: &BTreeMap<String, BTreeSet<String>>) -> u64 {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        sorted.dedup();
        let selected: BTreeSet<&str> = sorted.iter().map(|s| s.as_str()).collect();

        let mut hasher = DefaultHasher::new();
        sorted.hash(&mut hasher);
        for id in &sorted {
            if let Some(deps) = edges.get(*id) {
                for dep in deps.iter().filter(|d| selected.contains(d.as_str())) {
                    (id.as_str(), dep.as_str()).hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn edges(list: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        list.iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_layers_follow_longest_path() {
        let plan = plan(
            &ids(&["a", "b", "c", "d"]),
            &edges(&[("c", &["a", "b"]), ("d", &["c", "a"])]),
        )
        .unwrap();

        assert_eq!(plan.batches.len(), 3);
        assert_eq!(plan.batches[0].rule_ids, ids(&["a", "b"]));
        assert_eq!(plan.batches[1].rule_ids, ids(&["c"]));
        assert_eq!(plan.batches[2].rule_ids, ids(&["d"]));
    }

    #[test]
    fn test_edges_outside_selection_are_ignored() {
        let plan = plan(&ids(&["c"]), &edges(&[("c", &["a", "b"])])).unwrap();
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.rule_count(), 1);
    }

    #[test]
    fn test_cycle_names_a_member() {
        let err = plan(
            &ids(&["a", "b", "c", "x"]),
            &edges(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("x", &["a"])]),
        )
        .unwrap_err();

        let rule = err.rule().unwrap().to_string();
        assert!(["a", "b", "c"].contains(&rule.as_str()), "named {rule}");
        assert!(err.to_string().contains("cycle"));

        // Deterministic across calls
        let again = plan(
            &ids(&["a", "b", "c", "x"]),
            &edges(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("x", &["a"])]),
        )
        .unwrap_err();
        assert_eq!(err, again);
    }

    #[test]
    fn test_empty_plan() {
        let plan = plan(&[], &BTreeMap::new()).unwrap();
        assert!(plan.batches.is_empty());
    }

    #[test]
    fn test_planner_caches_by_fingerprint() {
        let planner = BatchPlanner::new();
        let e = edges(&[("b", &["a"])]);
        let first = planner.plan(&ids(&["a", "b"]), &e).unwrap();
        let second = planner.plan(&ids(&["b", "a"]), &e).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = planner.plan(&ids(&["a"]), &e).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
