use std::collections::{BTreeSet, HashMap, HashSet};

use cv_core::types::{Task, TaskStatus};
use cv_pipeline::{Result, TaskBoard};
use tracing::debug;
use uuid::Uuid;

/// Picks the next task to work on from a project's open tasks.
///
/// Ordering rules:
/// 1. Only open tasks (not `Done`, stage not `Complete`) are candidates.
/// 2. Higher `priority` wins.
/// 3. Ties keep creation order.
///
/// A task is eligible once every id in its `blocked_by` set is `Done`.
/// Blockers that cannot be found count as unresolved, so a task in a
/// dependency cycle is never eligible.
#[derive(Clone)]
pub struct TaskScheduler {
    board: TaskBoard,
}

impl TaskScheduler {
    pub fn new(board: TaskBoard) -> Self {
        Self { board }
    }

    /// Highest-priority eligible task of `project`, or `None` when idle.
    pub async fn next_for_project(&self, project: &str) -> Result<Option<Task>> {
        let candidates = self.board.list_open(project, None).await?;
        let statuses = self.blocker_statuses(&candidates).await?;
        let next = next_eligible_task(&candidates, &statuses).cloned();
        if let Some(task) = &next {
            debug!(task_id = %task.id, priority = task.priority, "next task selected");
        }
        Ok(next)
    }

    /// Current status of every task referenced as a blocker by `tasks`.
    pub async fn blocker_statuses(&self, tasks: &[Task]) -> Result<HashMap<Uuid, TaskStatus>> {
        let ids: BTreeSet<Uuid> = tasks
            .iter()
            .flat_map(|t| t.blocked_by.iter().copied())
            .collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self.board.store().task_statuses(ids).await?)
    }
}

/// Whether all of `task`'s blockers are `Done` according to `statuses`.
pub fn is_eligible(task: &Task, statuses: &HashMap<Uuid, TaskStatus>) -> bool {
    task.blocked_by
        .iter()
        .all(|id| statuses.get(id) == Some(&TaskStatus::Done))
}

/// First eligible open task by priority descending, ties in the given order.
pub fn next_eligible_task<'a>(
    candidates: &'a [Task],
    statuses: &HashMap<Uuid, TaskStatus>,
) -> Option<&'a Task> {
    let mut open: Vec<&Task> = candidates.iter().filter(|t| t.is_open()).collect();
    // Stable sort keeps the caller's order for equal priorities.
    open.sort_by(|a, b| b.priority.cmp(&a.priority));
    open.into_iter().find(|t| is_eligible(t, statuses))
}

/// Groups of open tasks that block each other in a cycle.
///
/// Each group is a strongly connected set of `blocked_by` edges among the
/// given tasks (a task blocking itself counts). Ids inside a group are
/// sorted and groups are ordered by their first id.
pub fn find_dependency_cycles(tasks: &[Task]) -> Vec<Vec<Uuid>> {
    let open: HashMap<Uuid, &Task> = tasks
        .iter()
        .filter(|t| t.status != TaskStatus::Done)
        .map(|t| (t.id, t))
        .collect();

    let mut ids: Vec<Uuid> = open.keys().copied().collect();
    ids.sort();

    let mut tarjan = Tarjan {
        graph: &open,
        index: 0,
        indices: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        groups: Vec::new(),
    };
    for id in ids {
        if !tarjan.indices.contains_key(&id) {
            tarjan.connect(id);
        }
    }

    let mut cycles: Vec<Vec<Uuid>> = tarjan
        .groups
        .into_iter()
        .filter(|group| {
            group.len() > 1
                || open
                    .get(&group[0])
                    .is_some_and(|t| t.blocked_by.contains(&t.id))
        })
        .map(|mut group| {
            group.sort();
            group
        })
        .collect();
    cycles.sort();
    cycles
}

// ---------------------------------------------------------------------------
// Tarjan's strongly connected components
// ---------------------------------------------------------------------------

struct Tarjan<'a> {
    graph: &'a HashMap<Uuid, &'a Task>,
    index: usize,
    indices: HashMap<Uuid, usize>,
    lowlink: HashMap<Uuid, usize>,
    stack: Vec<Uuid>,
    on_stack: HashSet<Uuid>,
    groups: Vec<Vec<Uuid>>,
}

impl Tarjan<'_> {
    fn connect(&mut self, v: Uuid) {
        self.indices.insert(v, self.index);
        self.lowlink.insert(v, self.index);
        self.index += 1;
        self.stack.push(v);
        self.on_stack.insert(v);

        let edges: Vec<Uuid> = self
            .graph
            .get(&v)
            .map(|t| {
                t.blocked_by
                    .iter()
                    .copied()
                    .filter(|w| self.graph.contains_key(w))
                    .collect()
            })
            .unwrap_or_default();

        for w in edges {
            if !self.indices.contains_key(&w) {
                self.connect(w);
                let low = self.lowlink[&v].min(self.lowlink[&w]);
                self.lowlink.insert(v, low);
            } else if self.on_stack.contains(&w) {
                let low = self.lowlink[&v].min(self.indices[&w]);
                self.lowlink.insert(v, low);
            }
        }

        if self.lowlink[&v] == self.indices[&v] {
            let mut group = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack.remove(&w);
                group.push(w);
                if w == v {
                    break;
                }
            }
            self.groups.push(group);
        }
    }
}
