//! Action graph construction
//!
//! Bulk work is split into ordered chunks, one action per chunk, each action
//! depending on the previous one. Independent phases are built separately and
//! joined by [`concat_phases`], which renumbers every action in a single pass
//! and links each phase to the tail of the phase before it. The result is
//! always a linear chain, which keeps vendor-side ordering intact without any
//! extra coordination.

use crate::action::{Action, ActionIdSeq, ActionKind};
use crate::error::{CoreError, Result};
use crate::ids::ActionId;
use crate::retry::RetryPolicy;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Range;

/// Items of the input list covered by one chunk action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub action_id: ActionId,
    pub range: Range<usize>,
}

/// Incremental builder for a linear chain of actions
#[derive(Debug, Clone)]
pub struct ActionGraphBuilder {
    seq: ActionIdSeq,
    tail: Option<ActionId>,
    actions: Vec<Action>,
}

impl ActionGraphBuilder {
    pub fn new(seq: ActionIdSeq) -> Self {
        Self {
            seq,
            tail: None,
            actions: Vec::new(),
        }
    }

    /// Make the next pushed action depend on `predecessor`
    pub fn after(mut self, predecessor: ActionId) -> Self {
        self.tail = Some(predecessor);
        self
    }

    /// Append a single action to the chain
    pub fn push(
        &mut self,
        kind: &ActionKind,
        params: serde_json::Value,
        retry: RetryPolicy,
    ) -> Result<ActionId> {
        retry.validate()?;
        let (id, seq) = self.seq.take();
        self.seq = seq;

        let depends_on = self.tail.iter().cloned().collect();
        self.actions.push(
            Action::new(id.clone(), kind.clone())
                .with_params(params)
                .with_depends_on(depends_on)
                .with_retry(retry),
        );
        self.tail = Some(id.clone());
        Ok(id)
    }

    /// Split `items` into chunks of at most `chunk_size` and append one action per chunk
    ///
    /// `params_fn` materializes each chunk's payload and receives the id the
    /// chunk was assigned. An empty item list appends nothing.
    pub fn push_chunks<T, F>(
        &mut self,
        items: &[T],
        chunk_size: usize,
        kind: &ActionKind,
        retry: RetryPolicy,
        mut params_fn: F,
    ) -> Result<Vec<ChunkSpan>>
    where
        F: FnMut(&ActionId, &[T]) -> Result<serde_json::Value>,
    {
        if chunk_size == 0 {
            return Err(CoreError::InvalidChunkSize);
        }

        let mut spans = Vec::with_capacity(items.len().div_ceil(chunk_size));
        for (index, chunk) in items.chunks(chunk_size).enumerate() {
            let start = index * chunk_size;
            let (next_id, _) = self.seq.take();
            let params = params_fn(&next_id, chunk)?;
            let id = self.push(kind, params, retry)?;
            spans.push(ChunkSpan {
                action_id: id,
                range: start..start + chunk.len(),
            });
        }
        Ok(spans)
    }

    /// Last action appended, or the explicit predecessor if nothing was appended yet
    pub fn tail(&self) -> Option<&ActionId> {
        self.tail.as_ref()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Hand back the actions and the advanced id sequence
    pub fn finish(self) -> (Vec<Action>, ActionIdSeq) {
        (self.actions, self.seq)
    }
}

/// Build a standalone chunk chain starting from `seq`
pub fn build_chain<T, F>(
    items: &[T],
    chunk_size: usize,
    kind: &ActionKind,
    retry: RetryPolicy,
    seq: ActionIdSeq,
    params_fn: F,
) -> Result<(Vec<Action>, Vec<ChunkSpan>, ActionIdSeq)>
where
    F: FnMut(&ActionId, &[T]) -> Result<serde_json::Value>,
{
    let mut builder = ActionGraphBuilder::new(seq);
    let spans = builder.push_chunks(items, chunk_size, kind, retry, params_fn)?;
    let (actions, seq) = builder.finish();
    Ok((actions, spans, seq))
}

/// Phases joined into one chain
#[derive(Debug, Clone)]
pub struct PhaseChain {
    pub actions: Vec<Action>,
    /// Old id to new id, one map per input phase
    pub renames: Vec<BTreeMap<ActionId, ActionId>>,
    pub seq: ActionIdSeq,
}

/// Concatenate independently built phases into one chain
///
/// Ids are reassigned in a single pass starting from `seq`. Dependencies are
/// remapped within each phase; root actions of a phase are made to depend on
/// the last action of the previous non-empty phase.
pub fn concat_phases(phases: Vec<Vec<Action>>, seq: ActionIdSeq) -> Result<PhaseChain> {
    let mut seq = seq;
    let mut actions = Vec::with_capacity(phases.iter().map(Vec::len).sum());
    let mut renames = Vec::with_capacity(phases.len());
    let mut previous_tail: Option<ActionId> = None;

    for phase in phases {
        let mut rename = BTreeMap::new();
        for action in &phase {
            let (id, next) = seq.take();
            seq = next;
            if rename.insert(action.id.clone(), id).is_some() {
                return Err(CoreError::DuplicateActionId(action.id.to_string()));
            }
        }

        let mut tail = None;
        for mut action in phase {
            let new_id = rename[&action.id].clone();
            let mut depends_on = Vec::with_capacity(action.depends_on.len().max(1));
            for dep in &action.depends_on {
                match rename.get(dep) {
                    Some(mapped) => depends_on.push(mapped.clone()),
                    None => {
                        return Err(CoreError::DependencyNotFound {
                            action: action.id.to_string(),
                            missing: dep.to_string(),
                        });
                    }
                }
            }
            if depends_on.is_empty() {
                if let Some(prev) = &previous_tail {
                    depends_on.push(prev.clone());
                }
            }
            action.id = new_id.clone();
            action.depends_on = depends_on;
            actions.push(action);
            tail = Some(new_id);
        }

        if tail.is_some() {
            previous_tail = tail;
        }
        renames.push(rename);
    }

    validate_graph(&actions)?;
    Ok(PhaseChain {
        actions,
        renames,
        seq,
    })
}

/// Reject duplicate ids, unknown dependencies, cycles and forward references
pub fn validate_graph(actions: &[Action]) -> Result<()> {
    let mut position: HashMap<&ActionId, usize> = HashMap::with_capacity(actions.len());
    for (i, action) in actions.iter().enumerate() {
        if position.insert(&action.id, i).is_some() {
            return Err(CoreError::DuplicateActionId(action.id.to_string()));
        }
    }

    for action in actions {
        for dep in &action.depends_on {
            if !position.contains_key(dep) {
                return Err(CoreError::DependencyNotFound {
                    action: action.id.to_string(),
                    missing: dep.to_string(),
                });
            }
        }
    }

    // Kahn's algorithm
    let mut indegree = vec![0usize; actions.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); actions.len()];
    for (i, action) in actions.iter().enumerate() {
        let unique: HashSet<&ActionId> = action.depends_on.iter().collect();
        indegree[i] = unique.len();
        for dep in unique {
            dependents[position[dep]].push(i);
        }
    }
    let mut ready: VecDeque<usize> = (0..actions.len()).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = ready.pop_front() {
        visited += 1;
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }
    if visited != actions.len() {
        let stuck = indegree
            .iter()
            .position(|&d| d > 0)
            .map(|i| actions[i].id.to_string())
            .unwrap_or_default();
        return Err(CoreError::CycleDetected(stuck));
    }

    for (i, action) in actions.iter().enumerate() {
        for dep in &action.depends_on {
            if position[dep] >= i {
                return Err(CoreError::ForwardReference {
                    action: action.id.to_string(),
                    dependency: dep.to_string(),
                });
            }
        }
    }

    Ok(())
}
