//! Session state for the active problem
//!
//! `Context` is the single owner of the in-memory step tree. User edits are
//! applied synchronously; network calls run outside of it and come back
//! through a `RequestTicket` so that a late response can never overwrite
//! newer local edits. `Core` shares a context between tasks and notifies
//! subscribers after every change.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{AbortHandle, AbortRegistration, Abortable};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::api::{Client, ClientError, CodeFeedback, ExecAction};
use crate::auth::{self, Credentials};
use crate::layout::{layout_with, LayoutCache, LayoutConfig, NodeBox, Point};
use crate::models::{HintKind, Step, StepPath, StepTree, StepVerdict, TreeError};
use crate::storage::{load_json, problem_key, save_json, KeyValueStore, Section, StoreError};
use crate::targeting::{DragConfig, DragSession, DropOutcome, InsertTarget};
use crate::tree::{self, IdIndex};

// Define the maximum size for the history buffer
const MAX_HISTORY_SIZE: usize = 20;

/// Tunables of a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// How long a step stays flagged as deleting before it is removed
    pub removal_grace: Duration,
    pub layout: LayoutConfig,
    pub drag: DragConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            removal_grace: Duration::from_millis(300),
            layout: LayoutConfig::default(),
            drag: DragConfig::default(),
        }
    }
}

/// Represents a single state transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub details: Option<String>,
}

impl TransitionLogEntry {
    pub fn new(action: String, details: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            details,
        }
    }
}

/// Network operations a session can have in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    LoadTree,
    SaveTree,
    CheckSteps,
    GenerateHints,
    Abstraction,
    StepsToCode,
    CheckCode,
    Execute,
}

impl RequestKind {
    /// Whether the response replaces or edits the tree
    pub fn mutates_tree(&self) -> bool {
        matches!(
            self,
            RequestKind::LoadTree
                | RequestKind::CheckSteps
                | RequestKind::GenerateHints
                | RequestKind::Abstraction
        )
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::LoadTree => "load tree",
            RequestKind::SaveTree => "save tree",
            RequestKind::CheckSteps => "check steps",
            RequestKind::GenerateHints => "generate hints",
            RequestKind::Abstraction => "abstraction",
            RequestKind::StepsToCode => "steps to code",
            RequestKind::CheckCode => "check code",
            RequestKind::Execute => "execute",
        };
        write!(f, "{}", name)
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("A {0} request is already in flight")]
    RequestInFlight(RequestKind),

    #[error("Discarded stale {kind} response: {reason}")]
    StaleResponse { kind: RequestKind, reason: String },

    #[error("The {0} request was aborted")]
    Aborted(RequestKind),

    #[error("No drag in progress")]
    NoDrag,
}

/// How a tree change relates to what requests send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    /// Content, structure or status of live steps
    Payload,
    /// Dropping steps that were already hidden
    Removal,
    /// UI flags only
    Presentation,
}

/// Proof that a request was issued against a given problem and tree revision
#[derive(Debug, Clone)]
pub struct RequestTicket {
    kind: RequestKind,
    generation: u64,
    problem_id: String,
    revision: u64,
}

impl RequestTicket {
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn problem_id(&self) -> &str {
        &self.problem_id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    abort: AbortHandle,
}

/// One run of the execution service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub action: ExecAction,
    pub code: String,
    pub output: String,
    pub at: DateTime<Utc>,
}

/// Execution state of the active problem, created on first use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    problem_id: String,
    runs: Vec<ExecutionRecord>,
}

impl ExecutionContext {
    fn new(problem_id: String) -> Self {
        Self {
            problem_id,
            runs: Vec::new(),
        }
    }

    pub fn problem_id(&self) -> &str {
        &self.problem_id
    }

    pub fn runs(&self) -> &[ExecutionRecord] {
        &self.runs
    }

    pub fn last_output(&self) -> Option<&str> {
        self.runs.last().map(|r| r.output.as_str())
    }
}

/// Summary of merging checker verdicts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub applied: Vec<String>,
    pub ignored: Vec<String>,
}

#[derive(Debug, Clone)]
struct PendingRemoval {
    id: String,
    started: Instant,
}

/// Context for the active problem
pub struct Context {
    config: SessionConfig,
    problem_id: String,
    problem_text: String,
    tree: StepTree,
    code: String,
    revision: u64,
    payload_revision: u64,
    structure_revision: u64,
    index: IdIndex,
    removals: Vec<PendingRemoval>,
    in_flight: HashMap<RequestKind, InFlight>,
    next_generation: u64,
    execution: Option<ExecutionContext>,
    drag: Option<DragSession>,
    layout_cache: LayoutCache,
    history: VecDeque<TransitionLogEntry>,
    store: Box<dyn KeyValueStore>,
    rng: StdRng,
}

impl Context {
    /// Opens a session for `problem_id`, restoring any locally saved state
    pub fn open(
        problem_id: impl Into<String>,
        store: Box<dyn KeyValueStore>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let mut context = Self {
            config,
            problem_id: problem_id.into(),
            problem_text: String::new(),
            tree: StepTree::new(),
            code: String::new(),
            revision: 0,
            payload_revision: 0,
            structure_revision: 0,
            index: IdIndex::default(),
            removals: Vec::new(),
            in_flight: HashMap::new(),
            next_generation: 0,
            execution: None,
            drag: None,
            layout_cache: LayoutCache::new(config.layout),
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
            store,
            rng: StdRng::from_entropy(),
        };
        context.restore()?;
        Ok(context)
    }

    /// Replaces the id generator with a seeded one
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn restore(&mut self) -> Result<(), SessionError> {
        let steps_key = problem_key(&self.problem_id, Section::Steps);
        let stored: StepTree = load_json(self.store.as_ref(), &steps_key)?.unwrap_or_default();
        // removals cut short by a previous run are finished here
        let live = stored.live();
        if live != stored {
            tracing::info!("Finishing interrupted removals of problem {}", self.problem_id);
            save_json(self.store.as_mut(), &steps_key, &live)?;
        }
        self.tree = live;

        let store = self.store.as_ref();
        self.code = load_json(store, &problem_key(&self.problem_id, Section::Code))?
            .unwrap_or_default();
        self.problem_text = load_json(store, &problem_key(&self.problem_id, Section::Problem))?
            .unwrap_or_default();
        self.index = IdIndex::build(&self.tree);
        Ok(())
    }

    /// Logs a state transition, maintaining the history buffer size.
    fn log_transition(&mut self, action: &str, details: Option<String>) {
        if self.history.len() == MAX_HISTORY_SIZE {
            self.history.pop_front(); // Remove the oldest entry
        }
        self.history
            .push_back(TransitionLogEntry::new(action.to_string(), details));
    }

    /// Persists a new tree, then installs it and bumps the revisions.
    ///
    /// Nothing changes in memory if the store refuses the write.
    fn commit(
        &mut self,
        tree: StepTree,
        change: Change,
        action: &str,
        details: Option<String>,
    ) -> Result<(), SessionError> {
        save_json(
            self.store.as_mut(),
            &problem_key(&self.problem_id, Section::Steps),
            &tree,
        )?;

        self.tree = tree;
        self.revision += 1;
        match change {
            Change::Payload => {
                self.payload_revision += 1;
                self.structure_revision += 1;
            }
            Change::Removal => self.structure_revision += 1,
            Change::Presentation => {}
        }
        self.index = IdIndex::build(&self.tree);

        // a replaced tree may have dropped or revived steps that were deleting
        let tree = &self.tree;
        self.removals
            .retain(|r| tree.find_by_id(&r.id).map_or(false, |s| s.is_deleting()));

        self.log_transition(action, details);
        Ok(())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn problem_id(&self) -> &str {
        &self.problem_id
    }

    pub fn problem_text(&self) -> &str {
        &self.problem_text
    }

    pub fn tree(&self) -> &StepTree {
        &self.tree
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Incremented on every change to the tree
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Incremented only on changes a request payload can see. Responses to
    /// tree requests are discarded when it moved.
    pub fn payload_revision(&self) -> u64 {
        self.payload_revision
    }

    /// The revision a response of `kind` must still match
    fn guard_revision(&self, kind: RequestKind) -> u64 {
        match kind {
            // abstraction paths index the full tree, hidden steps included
            RequestKind::Abstraction => self.structure_revision,
            _ => self.payload_revision,
        }
    }

    pub fn path_of(&self, id: &str) -> Option<&StepPath> {
        self.index.path(id)
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionLogEntry> {
        self.history.iter()
    }

    pub fn execution(&self) -> Option<&ExecutionContext> {
        self.execution.as_ref()
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    /// Positioned boxes for the current tree
    pub fn layout(&mut self) -> Vec<NodeBox> {
        // entries for replaced subtrees are never hit again
        if self.layout_cache.len() > 2 * self.tree.len() + 64 {
            self.layout_cache.clear();
        }
        layout_with(&self.tree, &mut self.layout_cache)
    }

    pub fn set_problem_text(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        self.problem_text = text.into();
        save_json(
            self.store.as_mut(),
            &problem_key(&self.problem_id, Section::Problem),
            &self.problem_text,
        )?;
        Ok(())
    }

    pub fn set_code(&mut self, code: impl Into<String>) -> Result<(), SessionError> {
        self.code = code.into();
        save_json(
            self.store.as_mut(),
            &problem_key(&self.problem_id, Section::Code),
            &self.code,
        )?;
        Ok(())
    }

    /// Switches to another problem: aborts in-flight requests, drops
    /// transient state and restores the new problem from the store
    pub fn switch_problem(&mut self, problem_id: impl Into<String>) -> Result<(), SessionError> {
        let problem_id = problem_id.into();
        for (kind, in_flight) in self.in_flight.drain() {
            tracing::info!("Aborting {} request on problem change", kind);
            in_flight.abort.abort();
        }
        self.removals.clear();
        self.drag = None;
        self.execution = None;
        self.problem_id = problem_id.clone();
        self.restore()?;
        self.revision += 1;
        self.payload_revision += 1;
        self.structure_revision += 1;
        self.log_transition("switch_problem", Some(format!("Switched to problem {}", problem_id)));
        Ok(())
    }

    /// Generates an id not used by any step of the tree
    pub fn new_step_id(&mut self) -> String {
        loop {
            let id = format!("step-{:016x}", self.rng.gen::<u64>());
            if !self.tree.contains_id(&id) {
                return id;
            }
        }
    }

    // Structural edits

    /// Inserts `step` as child `index` of the step at `parent`, returning its path
    pub fn insert_step(
        &mut self,
        parent: &[usize],
        index: usize,
        step: Step,
    ) -> Result<StepPath, SessionError> {
        let id = step.id().to_string();
        let next = tree::insert(&self.tree, parent, index, step)?;
        self.commit(
            next,
            Change::Payload,
            "insert_step",
            Some(format!("Inserted step {} under {:?} at {}", id, parent, index)),
        )?;

        let mut path = parent.to_vec();
        path.push(index);
        Ok(path)
    }

    /// Appends a new step with the given content as the last child of `parent`
    pub fn add_step(
        &mut self,
        parent: &[usize],
        content: impl Into<String>,
    ) -> Result<StepPath, SessionError> {
        let index = self
            .tree
            .children_at(parent)
            .map(|c| c.len())
            .ok_or_else(|| TreeError::PathNotFound(parent.to_vec()))?;
        let step = Step::new(self.new_step_id(), content);
        self.insert_step(parent, index, step)
    }

    pub fn edit_content(
        &mut self,
        path: &[usize],
        content: impl Into<String>,
    ) -> Result<(), SessionError> {
        let next = tree::update_content_at_path(&self.tree, path, content)?;
        self.commit(next, Change::Payload, "edit_content", Some(format!("Edited step at {:?}", path)))
    }

    pub fn reveal_correct_step(&mut self, path: &[usize]) -> Result<(), SessionError> {
        let next = tree::reveal_correct_step(&self.tree, path)?;
        self.commit(
            next,
            Change::Payload,
            "reveal_correct_step",
            Some(format!("Revealed correct step at {:?}", path)),
        )
    }

    pub fn toggle_hint(&mut self, id: &str, which: HintKind) -> Result<(), SessionError> {
        let next = tree::toggle_hint_visibility(&self.tree, id, which)?;
        self.commit(
            next,
            Change::Presentation,
            "toggle_hint",
            Some(format!("Toggled {} hint of {}", which, id)),
        )
    }

    pub fn set_expanded(&mut self, id: &str, expanded: bool) -> Result<(), SessionError> {
        let next = tree::set_expanded(&self.tree, id, expanded)?;
        self.commit(next, Change::Presentation, "set_expanded", None)
    }

    pub fn set_selected(&mut self, id: &str, selected: bool) -> Result<(), SessionError> {
        let next = tree::set_selected(&self.tree, id, selected)?;
        self.commit(next, Change::Presentation, "set_selected", None)
    }

    /// Called once the entry transition of a newly inserted step has finished
    pub fn acknowledge_inserted(&mut self, id: &str) -> Result<(), SessionError> {
        let next = tree::clear_newly_inserted(&self.tree, id)?;
        self.commit(next, Change::Presentation, "acknowledge_inserted", None)
    }

    // Two-phase removal

    /// Starts removing a step: it and its subtree are flagged as deleting
    pub fn begin_removal(&mut self, id: &str, now: Instant) -> Result<(), SessionError> {
        if self.removals.iter().any(|r| r.id == id) {
            return Ok(());
        }

        let next = tree::mark_deleting(&self.tree, id)?;
        self.commit(
            next,
            Change::Payload,
            "begin_removal",
            Some(format!("Deleting step {}", id)),
        )?;
        self.removals.push(PendingRemoval {
            id: id.to_string(),
            started: now,
        });
        Ok(())
    }

    /// Finishes a removal once the exit transition is done.
    ///
    /// Returns false if no removal was pending for the id.
    pub fn complete_removal(&mut self, id: &str) -> Result<bool, SessionError> {
        if !self.removals.iter().any(|r| r.id == id) {
            return Ok(false);
        }

        // the subtree is already hidden from live payloads
        let next = tree::remove_by_id(&self.tree, id);
        self.commit(
            next,
            Change::Removal,
            "remove_step",
            Some(format!("Removed step {}", id)),
        )?;
        self.removals.retain(|r| r.id != id);
        Ok(true)
    }

    /// Ids whose grace period has elapsed at `now`
    pub fn due_removals(&self, now: Instant) -> Vec<String> {
        self.removals
            .iter()
            .filter(|r| now.saturating_duration_since(r.started) >= self.config.removal_grace)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Completes every removal whose grace period has elapsed
    pub fn complete_due_removals(&mut self, now: Instant) -> Result<Vec<String>, SessionError> {
        let due = self.due_removals(now);
        for id in &due {
            self.complete_removal(id)?;
        }
        Ok(due)
    }

    pub fn pending_removals(&self) -> Vec<&str> {
        self.removals.iter().map(|r| r.id.as_str()).collect()
    }

    // Drag-insert

    /// Starts dragging a new blank step
    pub fn start_drag(&mut self) -> &DragSession {
        let ghost = Step::blank(self.new_step_id());
        self.drag.insert(DragSession::start(ghost, self.config.drag))
    }

    pub fn drag(&self) -> Option<&DragSession> {
        self.drag.as_ref()
    }

    /// Updates the drag target for a new pointer position
    pub fn drag_to(&mut self, pointer: Point) -> Result<Option<InsertTarget>, SessionError> {
        let boxes = self.layout();
        let drag = self.drag.as_mut().ok_or(SessionError::NoDrag)?;
        Ok(drag.pointer_moved(&boxes, pointer).cloned())
    }

    /// The tree with the ghost step shown at the current target
    pub fn drag_preview(&self) -> Option<StepTree> {
        self.drag.as_ref()?.preview(&self.tree)
    }

    /// Drops the dragged step; returns where it landed, or None if discarded
    pub fn drop_drag(&mut self) -> Result<Option<InsertTarget>, SessionError> {
        let drag = self.drag.take().ok_or(SessionError::NoDrag)?;
        match drag.drop(&self.tree)? {
            DropOutcome::Committed { tree, target } => {
                self.commit(
                    tree,
                    Change::Payload,
                    "drop_step",
                    Some(format!("Dropped step under {:?} at {}", target.parent, target.index)),
                )?;
                Ok(Some(target))
            }
            DropOutcome::Discarded => {
                self.log_transition("drop_discarded", None);
                Ok(None)
            }
        }
    }

    /// Escape during a drag
    pub fn cancel_drag(&mut self) {
        if let Some(drag) = self.drag.take() {
            drag.cancel();
            self.log_transition("drag_cancelled", None);
        }
    }

    // Request guard

    pub fn is_request_in_flight(&self, kind: RequestKind) -> bool {
        self.in_flight.contains_key(&kind)
    }

    /// Registers a new request of `kind`.
    ///
    /// The returned registration should wrap the request future so that a
    /// problem change can abort it.
    pub fn begin_request(
        &mut self,
        kind: RequestKind,
    ) -> Result<(RequestTicket, AbortRegistration), SessionError> {
        if self.in_flight.contains_key(&kind) {
            return Err(SessionError::RequestInFlight(kind));
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let (abort, registration) = AbortHandle::new_pair();
        self.in_flight.insert(kind, InFlight { generation, abort });

        let ticket = RequestTicket {
            kind,
            generation,
            problem_id: self.problem_id.clone(),
            revision: self.guard_revision(kind),
        };
        tracing::debug!("Started {} request (generation {})", kind, generation);
        Ok((ticket, registration))
    }

    /// Releases the ticket's slot without applying anything.
    ///
    /// Returns false if the ticket no longer owned the slot.
    pub fn finish_request(&mut self, ticket: &RequestTicket) -> bool {
        match self.in_flight.get(&ticket.kind) {
            Some(in_flight) if in_flight.generation == ticket.generation => {
                self.in_flight.remove(&ticket.kind);
                true
            }
            _ => false,
        }
    }

    /// Releases the ticket's slot and checks that its response still applies
    fn settle(&mut self, ticket: &RequestTicket) -> Result<(), SessionError> {
        let stale = |reason: &str| SessionError::StaleResponse {
            kind: ticket.kind,
            reason: reason.to_string(),
        };

        if !self.finish_request(ticket) {
            return Err(stale("the request was aborted or superseded"));
        }

        if ticket.problem_id != self.problem_id {
            return Err(stale("the active problem changed"));
        }
        let current = self.guard_revision(ticket.kind);
        if ticket.kind.mutates_tree() && ticket.revision != current {
            tracing::warn!(
                "Dropping {} response for revision {} (now {})",
                ticket.kind,
                ticket.revision,
                current
            );
            return Err(stale("the tree changed while the request was in flight"));
        }
        Ok(())
    }

    /// Records a failed request. A rejected token forces a logout.
    ///
    /// Returns true if the stored credentials were cleared.
    pub fn fail_request(
        &mut self,
        ticket: &RequestTicket,
        error: &ClientError,
    ) -> Result<bool, SessionError> {
        self.finish_request(ticket);

        tracing::warn!("{} request failed: {}", ticket.kind, error);
        self.log_transition(
            "request_failed",
            Some(format!("{} request failed: {}", ticket.kind, error)),
        );

        if error.is_unauthorized() {
            self.logout()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn apply_loaded_tree(
        &mut self,
        ticket: &RequestTicket,
        tree: StepTree,
    ) -> Result<(), SessionError> {
        self.settle(ticket)?;
        if let Some(dup) = tree.first_duplicate_id() {
            return Err(TreeError::DuplicateId(dup).into());
        }
        let count = tree.len();
        self.commit(
            tree,
            Change::Payload,
            "load_tree",
            Some(format!("Loaded {} steps", count)),
        )
    }

    pub fn finish_save(&mut self, ticket: &RequestTicket) -> Result<(), SessionError> {
        self.settle(ticket)?;
        self.log_transition("save_tree", None);
        Ok(())
    }

    /// Merges checker verdicts, statuses included, into the tree
    pub fn apply_verdicts(
        &mut self,
        ticket: &RequestTicket,
        verdicts: Vec<StepVerdict>,
    ) -> Result<CheckReport, SessionError> {
        self.settle(ticket)?;
        let outcome = tree::apply_check_result(&self.tree, &verdicts);
        self.merge_outcome(outcome, "apply_verdicts")
    }

    /// Merges generated hints into the tree without touching statuses
    pub fn apply_hints(
        &mut self,
        ticket: &RequestTicket,
        verdicts: Vec<StepVerdict>,
    ) -> Result<CheckReport, SessionError> {
        self.settle(ticket)?;
        let outcome = tree::apply_hint_result(&self.tree, &verdicts);
        self.merge_outcome(outcome, "apply_hints")
    }

    fn merge_outcome(
        &mut self,
        outcome: tree::CheckOutcome,
        action: &str,
    ) -> Result<CheckReport, SessionError> {
        if !outcome.ignored.is_empty() {
            tracing::warn!("Ignored verdicts for unknown steps: {:?}", outcome.ignored);
        }

        let report = CheckReport {
            applied: outcome.applied,
            ignored: outcome.ignored,
        };
        self.commit(
            outcome.tree,
            Change::Payload,
            action,
            Some(format!(
                "{} verdicts applied, {} ignored",
                report.applied.len(),
                report.ignored.len()
            )),
        )?;
        Ok(report)
    }

    pub fn apply_abstraction(
        &mut self,
        ticket: &RequestTicket,
        path: &[usize],
        steps: Vec<Step>,
    ) -> Result<(), SessionError> {
        self.settle(ticket)?;
        let next = tree::replace_subtree(&self.tree, path, steps)?;
        self.commit(
            next,
            Change::Payload,
            "apply_abstraction",
            Some(format!("Replaced children of {:?}", path)),
        )
    }

    pub fn apply_code(&mut self, ticket: &RequestTicket, code: String) -> Result<(), SessionError> {
        self.settle(ticket)?;
        self.log_transition("apply_code", None);
        self.set_code(code)
    }

    pub fn apply_code_feedback(
        &mut self,
        ticket: &RequestTicket,
        feedback: CodeFeedback,
    ) -> Result<CodeFeedback, SessionError> {
        self.settle(ticket)?;
        self.log_transition(
            "check_code",
            Some(format!("Code correct: {}", feedback.correct)),
        );
        Ok(feedback)
    }

    pub fn record_execution(
        &mut self,
        ticket: &RequestTicket,
        action: ExecAction,
        code: String,
        output: String,
    ) -> Result<(), SessionError> {
        self.settle(ticket)?;
        let record = ExecutionRecord {
            action,
            code,
            output,
            at: Utc::now(),
        };
        self.execution_mut().runs.push(record);
        self.log_transition("execute", Some(format!("Ran code ({})", action)));
        Ok(())
    }

    /// The execution context of the active problem, created on first use
    pub fn execution_mut(&mut self) -> &mut ExecutionContext {
        let problem_id = self.problem_id.clone();
        self.execution
            .get_or_insert_with(|| ExecutionContext::new(problem_id))
    }

    // Credentials

    /// Valid stored credentials; expired ones are cleared
    pub fn credentials(&mut self, now: DateTime<Utc>) -> Result<Option<Credentials>, SessionError> {
        Ok(auth::active_credentials(self.store.as_mut(), now)?)
    }

    pub fn is_authenticated(&mut self, now: DateTime<Utc>) -> Result<bool, SessionError> {
        Ok(self.credentials(now)?.is_some())
    }

    pub fn login(&mut self, credentials: &Credentials) -> Result<(), SessionError> {
        auth::store_credentials(self.store.as_mut(), credentials)?;
        self.log_transition("login", credentials.username.clone());
        Ok(())
    }

    pub fn logout(&mut self) -> Result<(), SessionError> {
        auth::clear_credentials(self.store.as_mut())?;
        self.log_transition("logout", None);
        Ok(())
    }
}

#[derive(Clone)]
pub struct Core {
    inner: Arc<Mutex<Context>>,
    update_tx: Arc<tokio::sync::broadcast::Sender<()>>,
}

impl Core {
    pub fn new(context: Context) -> Self {
        // Create a broadcast channel with capacity for 100 messages
        let (tx, _rx) = tokio::sync::broadcast::channel(100);

        Self {
            inner: Arc::new(Mutex::new(context)),
            update_tx: Arc::new(tx),
        }
    }

    /// Runs `f` against the context and notifies observers
    pub fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Context) -> R,
    {
        let mut context = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let result = f(&mut context);

        // Notify observers about state changes
        let _ = self.update_tx.send(());

        result
    }

    /// Runs `f` against the context without notifying observers
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Context) -> R,
    {
        let context = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&context)
    }

    // Subscribe to state updates
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.update_tx.subscribe()
    }

    /// Awaits a request future unless it is aborted, recording failures
    async fn guarded<T, Fut>(
        &self,
        ticket: &RequestTicket,
        registration: AbortRegistration,
        request: Fut,
    ) -> Result<T, SessionError>
    where
        Fut: Future<Output = Result<T, ClientError>>,
    {
        match Abortable::new(request, registration).await {
            Err(_aborted) => {
                tracing::info!("{} request aborted", ticket.kind);
                Err(SessionError::Aborted(ticket.kind))
            }
            Ok(Err(error)) => {
                if let Err(e) = self.update(|c| c.fail_request(ticket, &error)) {
                    tracing::error!("Failed to record request failure: {}", e);
                }
                Err(error.into())
            }
            Ok(Ok(value)) => Ok(value),
        }
    }

    /// Loads the saved tree of the active problem from the backend
    pub async fn load_tree(&self, client: &dyn Client) -> Result<(), SessionError> {
        let (ticket, registration) = self.update(|c| c.begin_request(RequestKind::LoadTree))?;
        let tree = self
            .guarded(&ticket, registration, client.load_step_tree(ticket.problem_id()))
            .await?;
        self.update(|c| c.apply_loaded_tree(&ticket, tree))
    }

    /// Saves the current tree of the active problem to the backend
    pub async fn save_tree(&self, client: &dyn Client) -> Result<(), SessionError> {
        let (ticket, registration, tree) = self.update(|c| {
            let (ticket, registration) = c.begin_request(RequestKind::SaveTree)?;
            Ok::<_, SessionError>((ticket, registration, c.tree().live()))
        })?;
        self.guarded(
            &ticket,
            registration,
            client.save_step_tree(ticket.problem_id(), &tree),
        )
        .await?;
        self.update(|c| c.finish_save(&ticket))
    }

    /// Sends the live tree to the checker and merges its verdicts
    pub async fn check_steps(&self, client: &dyn Client) -> Result<CheckReport, SessionError> {
        let (ticket, registration, problem, tree) = self.update(|c| {
            let (ticket, registration) = c.begin_request(RequestKind::CheckSteps)?;
            Ok::<_, SessionError>((
                ticket,
                registration,
                c.problem_text().to_string(),
                c.tree().live(),
            ))
        })?;
        let verdicts = self
            .guarded(&ticket, registration, client.check_steps(&problem, &tree))
            .await?;
        self.update(|c| c.apply_verdicts(&ticket, verdicts))
    }

    /// Requests hints for every live step
    pub async fn generate_hints(&self, client: &dyn Client) -> Result<CheckReport, SessionError> {
        let (ticket, registration, problem, tree) = self.update(|c| {
            let (ticket, registration) = c.begin_request(RequestKind::GenerateHints)?;
            Ok::<_, SessionError>((
                ticket,
                registration,
                c.problem_text().to_string(),
                c.tree().live(),
            ))
        })?;
        let verdicts = self
            .guarded(&ticket, registration, client.generate_hints(&problem, &tree))
            .await?;
        self.update(|c| c.apply_hints(&ticket, verdicts))
    }

    /// Replaces the children of the step at `path` with an abstraction result
    pub async fn request_abstraction(
        &self,
        client: &dyn Client,
        path: StepPath,
    ) -> Result<(), SessionError> {
        let (ticket, registration, tree) = self.update(|c| {
            if !path.is_empty() && c.tree().get(&path).is_none() {
                return Err(SessionError::Tree(TreeError::PathNotFound(path.clone())));
            }
            let (ticket, registration) = c.begin_request(RequestKind::Abstraction)?;
            Ok((ticket, registration, c.tree().clone()))
        })?;
        let steps = self
            .guarded(&ticket, registration, client.request_abstraction(&tree, &path))
            .await?;
        self.update(|c| c.apply_abstraction(&ticket, &path, steps))
    }

    /// Generates code from the live tree and stores it as the problem's code
    pub async fn steps_to_code(&self, client: &dyn Client) -> Result<String, SessionError> {
        let (ticket, registration, problem, tree) = self.update(|c| {
            let (ticket, registration) = c.begin_request(RequestKind::StepsToCode)?;
            Ok::<_, SessionError>((
                ticket,
                registration,
                c.problem_text().to_string(),
                c.tree().live(),
            ))
        })?;
        let code = self
            .guarded(&ticket, registration, client.steps_to_code(&problem, &tree))
            .await?;
        self.update(|c| c.apply_code(&ticket, code.clone()))?;
        Ok(code)
    }

    /// Asks the reviewer for feedback on the problem's code
    pub async fn check_code(&self, client: &dyn Client) -> Result<CodeFeedback, SessionError> {
        let (ticket, registration, problem, code) = self.update(|c| {
            let (ticket, registration) = c.begin_request(RequestKind::CheckCode)?;
            Ok::<_, SessionError>((
                ticket,
                registration,
                c.problem_text().to_string(),
                c.code().to_string(),
            ))
        })?;
        let feedback = self
            .guarded(&ticket, registration, client.check_code(&problem, &code))
            .await?;
        self.update(|c| c.apply_code_feedback(&ticket, feedback))
    }

    /// Runs the problem's code in the execution sandbox
    pub async fn execute(
        &self,
        client: &dyn Client,
        action: ExecAction,
    ) -> Result<String, SessionError> {
        let (ticket, registration, code) = self.update(|c| {
            let (ticket, registration) = c.begin_request(RequestKind::Execute)?;
            Ok::<_, SessionError>((ticket, registration, c.code().to_string()))
        })?;
        let output = self
            .guarded(&ticket, registration, client.execute(&code, action))
            .await?;
        self.update(|c| c.record_execution(&ticket, action, code, output.clone()))?;
        Ok(output)
    }
}
