//! Dependency-graph construction for the plugin scheduler.
//!
//! Nodes are the plugins participating in the current run; edges come from
//! each descriptor's `runs_after` list plus the dynamic ordering
//! constraints discovered after CHECK (the `<phase>-dependency` verb).
//! Entries naming a plugin that is not part of the run (filtered out or
//! not applicable) are dropped: the ordering constraint is vacuous when
//! the other side never executes. Cycles abort the run before anything
//! starts.

use crate::errors::ScheduleError;
use crate::plugin::PluginDescriptor;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Index into the participant list (declaration order).
pub type NodeIndex = usize;

/// A validated DAG over the run's plugins.
#[derive(Debug)]
pub struct PluginGraph {
    plugins: Vec<Arc<PluginDescriptor>>,
    index_map: HashMap<String, NodeIndex>,
    /// index -> plugins that must wait for it.
    forward_edges: Vec<Vec<NodeIndex>>,
    /// index -> plugins it waits for.
    reverse_edges: Vec<Vec<NodeIndex>>,
}

impl PluginGraph {
    /// Build and validate the graph from the descriptors' static
    /// `runs_after` lists. Participant order is declaration order and is
    /// preserved.
    pub fn build(participants: &[Arc<PluginDescriptor>]) -> Result<Self, ScheduleError> {
        Self::build_with_edges(participants, &HashMap::new())
    }

    /// Build and validate the graph with additional ordering constraints,
    /// keyed by plugin name. Used at phase boundaries to fold in the
    /// dependencies plugins reported after CHECK.
    pub fn build_with_edges(
        participants: &[Arc<PluginDescriptor>],
        extra: &HashMap<String, Vec<String>>,
    ) -> Result<Self, ScheduleError> {
        let mut index_map = HashMap::new();
        for (i, plugin) in participants.iter().enumerate() {
            if index_map.insert(plugin.name.clone(), i).is_some() {
                return Err(ScheduleError::DuplicatePlugin(plugin.name.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); participants.len()];
        let mut reverse_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); participants.len()];
        for (to, plugin) in participants.iter().enumerate() {
            let dynamic = extra.get(&plugin.name).map(Vec::as_slice).unwrap_or(&[]);
            for dep in plugin.runs_after.iter().chain(dynamic) {
                match index_map.get(dep) {
                    Some(&from) if from != to => {
                        // Static and dynamic lists may repeat a constraint.
                        if !reverse_edges[to].contains(&from) {
                            forward_edges[from].push(to);
                            reverse_edges[to].push(from);
                        }
                    }
                    Some(_) => {
                        tracing::debug!(
                            plugin = %plugin.name,
                            "plugin names itself as a dependency, ignoring"
                        );
                    }
                    None => {
                        tracing::debug!(
                            plugin = %plugin.name,
                            dependency = %dep,
                            "runs_after names a plugin not in this run, ignoring"
                        );
                    }
                }
            }
        }

        let graph = Self {
            plugins: participants.to_vec(),
            index_map,
            forward_edges,
            reverse_edges,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn plugins(&self) -> &[Arc<PluginDescriptor>] {
        &self.plugins
    }

    pub fn get_index(&self, name: &str) -> Option<NodeIndex> {
        self.index_map.get(name).copied()
    }

    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependencies_satisfied(&self, index: NodeIndex, done: &HashSet<NodeIndex>) -> bool {
        self.dependencies(index).iter().all(|d| done.contains(d))
    }

    /// Kahn's algorithm; leftovers with nonzero in-degree name the cycle.
    fn check_acyclic(&self) -> Result<(), ScheduleError> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.len() {
            let participants: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.plugins[i].name.clone())
                .collect();
            return Err(ScheduleError::Cycle { participants });
        }
        Ok(())
    }

    /// Kahn-style waves: each wave is the maximal set of plugins whose
    /// predecessors are all in earlier waves. Used for dry-run display and
    /// tests; admission works from `dependencies_satisfied` incrementally.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut done: HashSet<NodeIndex> = HashSet::new();
        loop {
            let ready: Vec<NodeIndex> = (0..self.len())
                .filter(|i| !done.contains(i) && self.dependencies_satisfied(*i, &done))
                .collect();
            if ready.is_empty() {
                break;
            }
            waves.push(ready.iter().map(|&i| self.plugins[i].name.clone()).collect());
            done.extend(ready);
        }
        waves
    }
}
