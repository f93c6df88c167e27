//! Core models for the decomposition box
//!
//! This module contains the step tree data types shared by the mutation,
//! layout, targeting and session modules. Children are stored behind `Arc`
//! so that edits copy only the nodes along the edited path.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Correctness verdict assigned to a step by the checker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Correctness {
    Correct,
    Incorrect,
    Missing,
    #[default]
    Unset,
}

/// Whether the checker thinks a step can be decomposed further
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Divisibility {
    Can,
    Cannot,
    #[default]
    Unset,
}

/// The two independent status enumerations carried by every step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepStatus {
    #[serde(default)]
    pub correctness: Correctness,
    #[serde(default)]
    pub can_be_further_divided: Divisibility,
}

impl StepStatus {
    /// Creates a status from its two parts
    pub fn new(correctness: Correctness, can_be_further_divided: Divisibility) -> Self {
        Self {
            correctness,
            can_be_further_divided,
        }
    }

    /// Status of a step whose correct content has been revealed
    pub fn revealed() -> Self {
        Self::new(Correctness::Correct, Divisibility::Cannot)
    }

    pub fn is_unset(&self) -> bool {
        self.correctness == Correctness::Unset
            && self.can_be_further_divided == Divisibility::Unset
    }
}

/// Which of the two hints a visibility toggle addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HintKind {
    General,
    Detailed,
}

impl FromStr for HintKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(HintKind::General),
            "detailed" => Ok(HintKind::Detailed),
            other => Err(format!("unknown hint kind '{}'", other)),
        }
    }
}

impl fmt::Display for HintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HintKind::General => write!(f, "general"),
            HintKind::Detailed => write!(f, "detailed"),
        }
    }
}

/// Per-hint reveal flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HintVisibility {
    #[serde(default)]
    pub general: bool,
    #[serde(default)]
    pub detailed: bool,
}

impl HintVisibility {
    pub fn get(&self, kind: HintKind) -> bool {
        match kind {
            HintKind::General => self.general,
            HintKind::Detailed => self.detailed,
        }
    }

    pub(crate) fn toggle(&mut self, kind: HintKind) {
        match kind {
            HintKind::General => self.general = !self.general,
            HintKind::Detailed => self.detailed = !self.detailed,
        }
    }
}

/// One decomposition step and its subtree
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) code: String,
    #[serde(default)]
    pub(crate) content: String,
    #[serde(default)]
    pub(crate) status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) general_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) detailed_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) correct_step: Option<String>,
    #[serde(default)]
    pub(crate) children: Vec<Arc<Step>>,
    #[serde(default)]
    pub(crate) is_expanded: bool,
    #[serde(default)]
    pub(crate) is_deleting: bool,
    #[serde(default)]
    pub(crate) is_newly_inserted: bool,
    #[serde(default)]
    pub(crate) is_ghost: bool,
    #[serde(default)]
    pub(crate) selected: bool,
    #[serde(default)]
    pub(crate) hints_visible: HintVisibility,
}

impl Step {
    /// Creates a blank step: empty text, unset status, no children
    pub fn blank(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Creates a step with the given content
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_hints(mut self, general: Option<String>, detailed: Option<String>) -> Self {
        self.general_hint = general;
        self.detailed_hint = detailed;
        self
    }

    pub fn with_correct_step(mut self, correct_step: impl Into<String>) -> Self {
        self.correct_step = Some(correct_step.into());
        self
    }

    pub fn with_child(mut self, child: Step) -> Self {
        self.children.push(Arc::new(child));
        self
    }

    pub fn with_children(mut self, children: Vec<Step>) -> Self {
        self.children = children.into_iter().map(Arc::new).collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn general_hint(&self) -> Option<&str> {
        self.general_hint.as_deref()
    }

    pub fn detailed_hint(&self) -> Option<&str> {
        self.detailed_hint.as_deref()
    }

    /// Returns the hint text of the given kind
    pub fn hint(&self, kind: HintKind) -> Option<&str> {
        match kind {
            HintKind::General => self.general_hint(),
            HintKind::Detailed => self.detailed_hint(),
        }
    }

    pub fn correct_step(&self) -> Option<&str> {
        self.correct_step.as_deref()
    }

    pub fn children(&self) -> &[Arc<Step>] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_expanded(&self) -> bool {
        self.is_expanded
    }

    pub fn is_deleting(&self) -> bool {
        self.is_deleting
    }

    pub fn is_newly_inserted(&self) -> bool {
        self.is_newly_inserted
    }

    pub fn is_ghost(&self) -> bool {
        self.is_ghost
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn hints_visible(&self) -> HintVisibility {
        self.hints_visible
    }

    /// Children that are not in the middle of a removal transition
    pub fn live_children(&self) -> impl Iterator<Item = &Arc<Step>> {
        self.children.iter().filter(|c| !c.is_deleting)
    }

    /// Returns true if this step and all its live descendants are marked correct
    pub fn is_fully_correct(&self) -> bool {
        self.status.correctness == Correctness::Correct
            && self.live_children().all(|c| c.is_fully_correct())
    }

    /// Number of steps in this subtree, including this one
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(|c| c.subtree_len()).sum::<usize>()
    }

    /// Copy of this step with deleting descendants dropped
    fn live_copy(&self) -> Step {
        let mut step = self.clone();
        step.children = self
            .live_children()
            .map(|c| Arc::new(c.live_copy()))
            .collect();
        step
    }

    fn collect_ids<'a>(&'a self, out: &mut Vec<&'a str>) {
        out.push(&self.id);
        for child in &self.children {
            child.collect_ids(out);
        }
    }
}

/// Zero-based sibling indices locating a step from the root level
pub type StepPath = Vec<usize>;

/// Parses a comma separated path (e.g. "0,1,2"); the empty string is the root level
pub fn parse_path(path_str: &str) -> Result<StepPath, TreeError> {
    let trimmed = path_str.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    trimmed
        .split(',')
        .map(|s| s.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TreeError::InvalidPath(path_str.to_string()))
}

/// Renders a path the way steps are numbered for students ("1.2.3")
pub fn path_label(path: &[usize]) -> String {
    path.iter()
        .map(|i| (i + 1).to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Errors raised by structural tree operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("no step at path {0:?}")]
    PathNotFound(StepPath),

    #[error("insert index {index} out of range for parent {parent:?} with {len} children")]
    IndexOutOfRange {
        parent: StepPath,
        index: usize,
        len: usize,
    },

    #[error("step '{0}' not found")]
    StepNotFound(String),

    #[error("step id '{0}' already exists in the tree")]
    DuplicateId(String),

    #[error("step '{0}' is being deleted")]
    StepDeleting(String),

    #[error("invalid path '{0}'")]
    InvalidPath(String),
}

/// Counts of live steps per correctness verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub missing: usize,
    pub unset: usize,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.correct == self.total
    }
}

/// An ordered forest of steps; the implicit root is never rendered
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepTree {
    #[serde(default)]
    pub(crate) root: Vec<Arc<Step>>,
}

impl StepTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self {
            root: steps.into_iter().map(Arc::new).collect(),
        }
    }

    /// Top-level steps
    pub fn roots(&self) -> &[Arc<Step>] {
        &self.root
    }

    /// Consumes the tree, returning its top-level steps
    pub fn into_steps(self) -> Vec<Step> {
        self.root
            .into_iter()
            .map(|s| Arc::try_unwrap(s).unwrap_or_else(|shared| (*shared).clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Total number of steps in the tree
    pub fn len(&self) -> usize {
        self.root.iter().map(|s| s.subtree_len()).sum()
    }

    /// Gets the step at the given path
    pub fn get(&self, path: &[usize]) -> Option<&Step> {
        let (first, rest) = path.split_first()?;
        let mut current: &Step = self.root.get(*first)?;
        for &idx in rest {
            current = &**current.children.get(idx)?;
        }
        Some(current)
    }

    /// Children of the step at `path`, or the top-level steps for the empty path
    pub fn children_at(&self, path: &[usize]) -> Option<&[Arc<Step>]> {
        if path.is_empty() {
            Some(&self.root)
        } else {
            self.get(path).map(|s| s.children())
        }
    }

    /// Visits every step in pre-order together with its path
    pub fn walk(&self) -> Vec<(StepPath, &Step)> {
        fn visit<'a>(steps: &'a [Arc<Step>], prefix: &StepPath, out: &mut Vec<(StepPath, &'a Step)>) {
            for (i, step) in steps.iter().enumerate() {
                let mut path = prefix.clone();
                path.push(i);
                out.push((path.clone(), &**step));
                visit(&step.children, &path, out);
            }
        }

        let mut out = Vec::new();
        visit(&self.root, &Vec::new(), &mut out);
        out
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Step> {
        self.walk()
            .into_iter()
            .find(|(_, s)| s.id == id)
            .map(|(_, s)| s)
    }

    /// Current path of the step with the given id
    pub fn path_of(&self, id: &str) -> Option<StepPath> {
        self.walk()
            .into_iter()
            .find(|(_, s)| s.id == id)
            .map(|(p, _)| p)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.find_by_id(id).is_some()
    }

    /// Returns the first id that occurs more than once, if any
    pub fn first_duplicate_id(&self) -> Option<String> {
        let mut ids = Vec::new();
        for step in &self.root {
            step.collect_ids(&mut ids);
        }

        let mut seen = HashSet::new();
        ids.into_iter()
            .find(|id| !seen.insert(*id))
            .map(str::to_string)
    }

    /// Copy of the tree without steps in a removal transition
    pub fn live(&self) -> StepTree {
        StepTree {
            root: self
                .root
                .iter()
                .filter(|s| !s.is_deleting)
                .map(|s| Arc::new(s.live_copy()))
                .collect(),
        }
    }

    /// Tallies the correctness of every live step
    pub fn progress(&self) -> Progress {
        let mut progress = Progress::default();
        for (_, step) in self.live().walk() {
            progress.total += 1;
            match step.status.correctness {
                Correctness::Correct => progress.correct += 1,
                Correctness::Incorrect => progress.incorrect += 1,
                Correctness::Missing => progress.missing += 1,
                Correctness::Unset => progress.unset += 1,
            }
        }
        progress
    }
}

/// A checker verdict for one step, keyed by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepVerdict {
    pub id: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailed_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_step: Option<String>,
}

impl StepVerdict {
    pub fn new(id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            id: id.into(),
            status,
            general_hint: None,
            detailed_hint: None,
            correct_step: None,
        }
    }

    /// Flattens an annotated tree returned by the checker into per-step verdicts
    pub fn collect(tree: &StepTree) -> Vec<StepVerdict> {
        tree.walk()
            .into_iter()
            .map(|(_, step)| StepVerdict {
                id: step.id.clone(),
                status: step.status,
                general_hint: step.general_hint.clone(),
                detailed_hint: step.detailed_hint.clone(),
                correct_step: step.correct_step.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_tree() -> StepTree {
        StepTree::from_steps(vec![
            Step::new("a", "Read input").with_children(vec![
                Step::new("a1", "Split lines"),
                Step::new("a2", "Parse numbers"),
            ]),
            Step::new("b", "Sum values"),
        ])
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("0,1,2").unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_path(" 3 ").unwrap(), vec![3]);
        assert_eq!(parse_path("").unwrap(), Vec::<usize>::new());
        assert_eq!(
            parse_path("a,b"),
            Err(TreeError::InvalidPath("a,b".to_string()))
        );
    }

    #[test]
    fn test_path_label_is_one_based() {
        assert_eq!(path_label(&[0, 1, 2]), "1.2.3");
        assert_eq!(path_label(&[]), "");
    }

    #[test]
    fn test_get_and_path_of() {
        let tree = sample_tree();
        assert_eq!(tree.get(&[0, 1]).unwrap().content(), "Parse numbers");
        assert!(tree.get(&[0, 2]).is_none());
        assert!(tree.get(&[]).is_none());
        assert_eq!(tree.path_of("a2"), Some(vec![0, 1]));
        assert_eq!(tree.path_of("b"), Some(vec![1]));
        assert_eq!(tree.path_of("zzz"), None);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_walk_is_pre_order() {
        let tree = sample_tree();
        let ids: Vec<&str> = tree.walk().iter().map(|(_, s)| s.id()).collect();
        assert_eq!(ids, vec!["a", "a1", "a2", "b"]);
    }

    #[test]
    fn test_deserialize_backend_shape() {
        let json = r#"{
            "root": [
                {
                    "id": "s1",
                    "content": "Loop over the list",
                    "status": { "correctness": "incorrect", "can_be_further_divided": "can" },
                    "generalHint": "Think about indices",
                    "children": [ { "id": "s1-1" } ]
                }
            ]
        }"#;

        let tree: StepTree = serde_json::from_str(json).unwrap();
        let step = tree.get(&[0]).unwrap();
        assert_eq!(step.status().correctness, Correctness::Incorrect);
        assert_eq!(step.status().can_be_further_divided, Divisibility::Can);
        assert_eq!(step.general_hint(), Some("Think about indices"));
        assert_eq!(step.detailed_hint(), None);

        let child = tree.get(&[0, 0]).unwrap();
        assert!(child.status().is_unset());
        assert_eq!(child.content(), "");
    }

    #[test]
    fn test_live_and_progress_skip_deleting() {
        let mut tree = sample_tree();
        Arc::make_mut(&mut tree.root[1]).is_deleting = true;
        Arc::make_mut(&mut tree.root[0]).status = StepStatus::revealed();

        let live = tree.live();
        assert_eq!(live.len(), 3);

        let progress = tree.progress();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.correct, 1);
        assert_eq!(progress.unset, 2);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_first_duplicate_id() {
        let tree = sample_tree();
        assert_eq!(tree.first_duplicate_id(), None);

        let dup = StepTree::from_steps(vec![
            Step::new("x", "one").with_child(Step::new("y", "two")),
            Step::new("y", "three"),
        ]);
        assert_eq!(dup.first_duplicate_id(), Some("y".to_string()));
    }

    #[test]
    fn test_is_fully_correct() {
        let correct = StepStatus::new(Correctness::Correct, Divisibility::Cannot);
        let step = Step::new("p", "parent")
            .with_status(correct)
            .with_children(vec![Step::new("c", "child").with_status(correct)]);
        assert!(step.is_fully_correct());

        let step = step.with_child(Step::new("d", "pending"));
        assert!(!step.is_fully_correct());
    }
}
