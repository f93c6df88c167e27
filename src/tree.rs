//! Tree mutation operations
//!
//! Every operation takes the current tree by reference and returns a new tree.
//! Only the steps along the edited path are copied; untouched subtrees stay
//! shared with the input through their `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{HintKind, Step, StepPath, StepStatus, StepTree, StepVerdict, TreeError};

/// Walks to the step at `path`, copying shared nodes on the way down
fn step_mut<'a>(roots: &'a mut Vec<Arc<Step>>, path: &[usize]) -> Option<&'a mut Step> {
    let (first, rest) = path.split_first()?;
    let mut current = Arc::make_mut(roots.get_mut(*first)?);
    for &idx in rest {
        current = Arc::make_mut(current.children.get_mut(idx)?);
    }
    Some(current)
}

/// Children of the step at `path`, or the root level for the empty path
fn children_mut<'a>(roots: &'a mut Vec<Arc<Step>>, path: &[usize]) -> Option<&'a mut Vec<Arc<Step>>> {
    if path.is_empty() {
        Some(roots)
    } else {
        step_mut(roots, path).map(|step| &mut step.children)
    }
}

/// Applies `f` to the step at `path` in a copy of the tree
fn update_at_path<F>(tree: &StepTree, path: &[usize], f: F) -> Result<StepTree, TreeError>
where
    F: FnOnce(&mut Step) -> Result<(), TreeError>,
{
    let mut next = tree.clone();
    let step = step_mut(&mut next.root, path).ok_or_else(|| TreeError::PathNotFound(path.to_vec()))?;
    f(step)?;
    Ok(next)
}

/// Applies `f` to the step with the given id in a copy of the tree
fn update_by_id<F>(tree: &StepTree, id: &str, f: F) -> Result<StepTree, TreeError>
where
    F: FnOnce(&mut Step) -> Result<(), TreeError>,
{
    let path = tree
        .path_of(id)
        .ok_or_else(|| TreeError::StepNotFound(id.to_string()))?;
    update_at_path(tree, &path, f)
}

fn ensure_live(step: &Step) -> Result<(), TreeError> {
    if step.is_deleting {
        Err(TreeError::StepDeleting(step.id.clone()))
    } else {
        Ok(())
    }
}

/// Splices a step in without touching any of its flags
pub(crate) fn splice(
    tree: &StepTree,
    parent: &[usize],
    index: usize,
    step: Step,
) -> Result<StepTree, TreeError> {
    let incoming = StepTree::from_steps(vec![step]);
    if let Some((_, existing)) = incoming
        .walk()
        .into_iter()
        .find(|(_, s)| tree.contains_id(s.id()))
    {
        return Err(TreeError::DuplicateId(existing.id().to_string()));
    }
    if let Some(dup) = incoming.first_duplicate_id() {
        return Err(TreeError::DuplicateId(dup));
    }

    if let Some(parent_step) = tree.get(parent) {
        ensure_live(parent_step)?;
    }

    let mut next = tree.clone();
    let children = children_mut(&mut next.root, parent)
        .ok_or_else(|| TreeError::PathNotFound(parent.to_vec()))?;

    if index > children.len() {
        return Err(TreeError::IndexOutOfRange {
            parent: parent.to_vec(),
            index,
            len: children.len(),
        });
    }

    let mut incoming = incoming.root;
    children.insert(index, incoming.remove(0));
    Ok(next)
}

/// Inserts `step` as child number `index` of the step at `parent`.
///
/// The empty parent path addresses the root level. The ghost flag of the
/// inserted step is cleared; every other field is kept as given.
pub fn insert(
    tree: &StepTree,
    parent: &[usize],
    index: usize,
    mut step: Step,
) -> Result<StepTree, TreeError> {
    step.is_ghost = false;
    splice(tree, parent, index, step)
}

/// Removes the step with the given id and its subtree; unknown ids leave the tree unchanged
pub fn remove_by_id(tree: &StepTree, id: &str) -> StepTree {
    let Some(path) = tree.path_of(id) else {
        return tree.clone();
    };

    let mut next = tree.clone();
    let (last, parent) = match path.split_last() {
        Some(split) => split,
        None => return next,
    };
    if let Some(children) = children_mut(&mut next.root, parent) {
        children.remove(*last);
    }
    next
}

/// Flags the step and all of its descendants as being deleted
pub fn mark_deleting(tree: &StepTree, id: &str) -> Result<StepTree, TreeError> {
    fn mark(step: &mut Step) {
        step.is_deleting = true;
        for child in &mut step.children {
            mark(Arc::make_mut(child));
        }
    }

    update_by_id(tree, id, |step| {
        mark(step);
        Ok(())
    })
}

/// Replaces the content of the step at `path`.
///
/// The step's status and code are reset because any verdict computed for the
/// old content no longer applies.
pub fn update_content_at_path(
    tree: &StepTree,
    path: &[usize],
    content: impl Into<String>,
) -> Result<StepTree, TreeError> {
    let content = content.into();
    update_at_path(tree, path, move |step| {
        ensure_live(step)?;
        step.content = content;
        step.status = StepStatus::default();
        step.code.clear();
        Ok(())
    })
}

/// Replaces the content of the step at `path` with its revealed correct step.
///
/// One-way: the correct step text is consumed and the status pinned to
/// correct / cannot be further divided.
pub fn reveal_correct_step(tree: &StepTree, path: &[usize]) -> Result<StepTree, TreeError> {
    update_at_path(tree, path, |step| {
        ensure_live(step)?;
        if let Some(correct) = step.correct_step.take() {
            step.content = correct;
        }
        step.status = StepStatus::revealed();
        Ok(())
    })
}

/// Flips the reveal flag of one hint on the step with the given id
pub fn toggle_hint_visibility(
    tree: &StepTree,
    id: &str,
    which: HintKind,
) -> Result<StepTree, TreeError> {
    update_by_id(tree, id, |step| {
        ensure_live(step)?;
        step.hints_visible.toggle(which);
        Ok(())
    })
}

pub fn set_expanded(tree: &StepTree, id: &str, expanded: bool) -> Result<StepTree, TreeError> {
    update_by_id(tree, id, |step| {
        step.is_expanded = expanded;
        Ok(())
    })
}

pub fn set_selected(tree: &StepTree, id: &str, selected: bool) -> Result<StepTree, TreeError> {
    update_by_id(tree, id, |step| {
        ensure_live(step)?;
        step.selected = selected;
        Ok(())
    })
}

/// Clears the newly-inserted flag once the entry transition has finished
pub fn clear_newly_inserted(tree: &StepTree, id: &str) -> Result<StepTree, TreeError> {
    update_by_id(tree, id, |step| {
        step.is_newly_inserted = false;
        Ok(())
    })
}

/// Outcome of merging checker verdicts into a tree
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub tree: StepTree,
    /// Ids whose status was updated
    pub applied: Vec<String>,
    /// Ids that were unknown or in a removal transition
    pub ignored: Vec<String>,
}

/// Merges checker verdicts into the tree, the only way statuses are set
pub fn apply_check_result(tree: &StepTree, verdicts: &[StepVerdict]) -> CheckOutcome {
    merge_verdicts(tree, verdicts, true)
}

/// Merges generated hints into the tree. Statuses are left alone, whatever
/// the verdicts carry.
pub fn apply_hint_result(tree: &StepTree, verdicts: &[StepVerdict]) -> CheckOutcome {
    merge_verdicts(tree, verdicts, false)
}

fn merge_verdicts(tree: &StepTree, verdicts: &[StepVerdict], with_status: bool) -> CheckOutcome {
    let mut next = tree.clone();
    let mut applied = Vec::new();
    let mut ignored = Vec::new();

    for verdict in verdicts {
        let live = next
            .find_by_id(&verdict.id)
            .map(|s| !s.is_deleting)
            .unwrap_or(false);
        if !live {
            ignored.push(verdict.id.clone());
            continue;
        }

        let updated = update_by_id(&next, &verdict.id, |step| {
            if with_status {
                step.status = verdict.status;
            }
            if verdict.general_hint.is_some() {
                step.general_hint = verdict.general_hint.clone();
            }
            if verdict.detailed_hint.is_some() {
                step.detailed_hint = verdict.detailed_hint.clone();
            }
            if verdict.correct_step.is_some() {
                step.correct_step = verdict.correct_step.clone();
            }
            Ok(())
        });

        match updated {
            Ok(tree) => {
                next = tree;
                applied.push(verdict.id.clone());
            }
            Err(_) => ignored.push(verdict.id.clone()),
        }
    }

    CheckOutcome {
        tree: next,
        applied,
        ignored,
    }
}

/// Substitutes the children of the step at `path` (the root level for the
/// empty path) with an abstraction result
pub fn replace_subtree(
    tree: &StepTree,
    path: &[usize],
    steps: Vec<Step>,
) -> Result<StepTree, TreeError> {
    if let Some(parent) = tree.get(path) {
        ensure_live(parent)?;
    }

    let mut next = tree.clone();
    let children = children_mut(&mut next.root, path)
        .ok_or_else(|| TreeError::PathNotFound(path.to_vec()))?;
    *children = steps.into_iter().map(Arc::new).collect();

    if let Some(dup) = next.first_duplicate_id() {
        return Err(TreeError::DuplicateId(dup));
    }
    Ok(next)
}

/// Map from step id to its current path
#[derive(Debug, Clone, Default)]
pub struct IdIndex {
    paths: HashMap<String, StepPath>,
}

impl IdIndex {
    /// Builds the index for the current positions in `tree`
    pub fn build(tree: &StepTree) -> Self {
        let paths = tree
            .walk()
            .into_iter()
            .map(|(path, step)| (step.id().to_string(), path))
            .collect();
        Self { paths }
    }

    pub fn path(&self, id: &str) -> Option<&StepPath> {
        self.paths.get(id)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Correctness, Divisibility};
    use pretty_assertions::assert_eq;

    fn ids(steps: &[Arc<Step>]) -> Vec<&str> {
        steps.iter().map(|s| s.id()).collect()
    }

    fn abc() -> StepTree {
        StepTree::from_steps(vec![
            Step::new("A", "first"),
            Step::new("B", "second").with_children(vec![
                Step::new("B1", "second.one"),
                Step::new("B2", "second.two"),
            ]),
            Step::new("C", "third"),
        ])
    }

    #[test]
    fn test_insert_between_siblings() {
        let tree = abc();
        let next = insert(&tree, &[], 1, Step::blank("new")).unwrap();
        assert_eq!(ids(next.roots()), vec!["A", "new", "B", "C"]);
        // input untouched
        assert_eq!(ids(tree.roots()), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_insert_nested_and_at_end() {
        let tree = abc();
        let next = insert(&tree, &[1], 2, Step::blank("B3")).unwrap();
        assert_eq!(ids(next.get(&[1]).unwrap().children()), vec!["B1", "B2", "B3"]);

        let next = insert(&next, &[0], 0, Step::blank("A1")).unwrap();
        assert_eq!(next.path_of("A1"), Some(vec![0, 0]));
    }

    #[test]
    fn test_insert_shares_untouched_subtrees() {
        let tree = abc();
        let next = insert(&tree, &[], 0, Step::blank("Z")).unwrap();
        assert!(Arc::ptr_eq(&tree.roots()[1], &next.roots()[2]));

        let next = insert(&tree, &[1], 0, Step::blank("B0")).unwrap();
        assert!(!Arc::ptr_eq(&tree.roots()[1], &next.roots()[1]));
        assert!(Arc::ptr_eq(&tree.roots()[0], &next.roots()[0]));
    }

    #[test]
    fn test_insert_errors() {
        let tree = abc();
        assert_eq!(
            insert(&tree, &[7], 0, Step::blank("x")),
            Err(TreeError::PathNotFound(vec![7]))
        );
        assert_eq!(
            insert(&tree, &[], 4, Step::blank("x")),
            Err(TreeError::IndexOutOfRange {
                parent: vec![],
                index: 4,
                len: 3
            })
        );
        assert_eq!(
            insert(&tree, &[], 0, Step::blank("B2")),
            Err(TreeError::DuplicateId("B2".to_string()))
        );
    }

    #[test]
    fn test_insert_clears_ghost_flag() {
        let mut ghost = Step::blank("g");
        ghost.is_ghost = true;
        let next = insert(&StepTree::new(), &[], 0, ghost).unwrap();
        assert!(!next.get(&[0]).unwrap().is_ghost());
    }

    #[test]
    fn test_remove_by_id_preserves_order() {
        let tree = abc();
        let next = remove_by_id(&tree, "B");
        assert_eq!(ids(next.roots()), vec!["A", "C"]);
        assert!(!next.contains_id("B1"));

        let next = remove_by_id(&tree, "B1");
        assert_eq!(ids(next.get(&[1]).unwrap().children()), vec!["B2"]);
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let tree = abc();
        assert_eq!(remove_by_id(&tree, "missing"), tree);
    }

    #[test]
    fn test_mark_deleting_flags_subtree() {
        let tree = abc();
        let next = mark_deleting(&tree, "B").unwrap();
        assert!(next.get(&[1]).unwrap().is_deleting());
        assert!(next.get(&[1, 0]).unwrap().is_deleting());
        assert!(next.get(&[1, 1]).unwrap().is_deleting());
        assert!(!next.get(&[2]).unwrap().is_deleting());
        assert_eq!(next.len(), tree.len());
    }

    #[test]
    fn test_update_content_resets_status_and_code() {
        let checked = StepStatus::new(Correctness::Incorrect, Divisibility::Can);
        let tree = StepTree::from_steps(vec![Step::new("a", "old")
            .with_code("print(1)")
            .with_status(checked)
            .with_hints(Some("hint".to_string()), None)]);

        let next = update_content_at_path(&tree, &[0], "new text").unwrap();
        let step = next.get(&[0]).unwrap();
        assert_eq!(step.content(), "new text");
        assert!(step.status().is_unset());
        assert_eq!(step.code(), "");
        assert_eq!(step.general_hint(), Some("hint"));
    }

    #[test]
    fn test_update_content_rejects_deleting_and_missing() {
        let tree = mark_deleting(&abc(), "C").unwrap();
        assert_eq!(
            update_content_at_path(&tree, &[2], "x"),
            Err(TreeError::StepDeleting("C".to_string()))
        );
        assert_eq!(
            update_content_at_path(&tree, &[], "x"),
            Err(TreeError::PathNotFound(vec![]))
        );
    }

    #[test]
    fn test_reveal_correct_step_is_idempotent() {
        let tree = StepTree::from_steps(vec![Step::new("a", "wrong")
            .with_status(StepStatus::new(Correctness::Incorrect, Divisibility::Can))
            .with_correct_step("right")]);

        let once = reveal_correct_step(&tree, &[0]).unwrap();
        let step = once.get(&[0]).unwrap();
        assert_eq!(step.content(), "right");
        assert_eq!(step.correct_step(), None);
        assert_eq!(step.status(), StepStatus::revealed());

        let twice = reveal_correct_step(&once, &[0]).unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn test_toggle_hint_visibility() {
        let tree = abc();
        let next = toggle_hint_visibility(&tree, "B2", HintKind::Detailed).unwrap();
        let flags = next.get(&[1, 1]).unwrap().hints_visible();
        assert!(flags.detailed);
        assert!(!flags.general);

        let back = toggle_hint_visibility(&next, "B2", HintKind::Detailed).unwrap();
        assert!(!back.get(&[1, 1]).unwrap().hints_visible().detailed);

        assert_eq!(
            toggle_hint_visibility(&tree, "nope", HintKind::General),
            Err(TreeError::StepNotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_apply_check_result() {
        let tree = mark_deleting(&abc(), "C").unwrap();
        let mut verdict = StepVerdict::new(
            "B1",
            StepStatus::new(Correctness::Incorrect, Divisibility::Cannot),
        );
        verdict.correct_step = Some("use a loop".to_string());

        let outcome = apply_check_result(
            &tree,
            &[
                verdict,
                StepVerdict::new("C", StepStatus::revealed()),
                StepVerdict::new("ghost", StepStatus::revealed()),
            ],
        );

        assert_eq!(outcome.applied, vec!["B1".to_string()]);
        assert_eq!(outcome.ignored, vec!["C".to_string(), "ghost".to_string()]);
        let b1 = outcome.tree.get(&[1, 0]).unwrap();
        assert_eq!(b1.status().correctness, Correctness::Incorrect);
        assert_eq!(b1.correct_step(), Some("use a loop"));
        assert!(outcome.tree.get(&[2]).unwrap().status().is_unset());
    }

    #[test]
    fn test_apply_hint_result_keeps_status() {
        let checked = StepStatus::new(Correctness::Correct, Divisibility::Cannot);
        let tree = apply_check_result(&abc(), &[StepVerdict::new("A", checked)]).tree;

        // hint payloads usually carry no status, which decodes as unset
        let mut hint = StepVerdict::new("A", StepStatus::default());
        hint.general_hint = Some("think".to_string());
        let outcome = apply_hint_result(&tree, &[hint]);

        assert_eq!(outcome.applied, vec!["A".to_string()]);
        let a = outcome.tree.get(&[0]).unwrap();
        assert_eq!(a.status(), checked);
        assert_eq!(a.general_hint(), Some("think"));
    }

    #[test]
    fn test_replace_subtree() {
        let tree = abc();
        let next = replace_subtree(
            &tree,
            &[1],
            vec![Step::new("G", "generalised step")],
        )
        .unwrap();
        assert_eq!(ids(next.get(&[1]).unwrap().children()), vec!["G"]);

        assert_eq!(
            replace_subtree(&tree, &[1], vec![Step::new("A", "clash")]),
            Err(TreeError::DuplicateId("A".to_string()))
        );

        let root = replace_subtree(&tree, &[], vec![Step::new("R", "only")]).unwrap();
        assert_eq!(ids(root.roots()), vec!["R"]);
    }

    #[test]
    fn test_id_index() {
        let tree = abc();
        let index = IdIndex::build(&tree);
        assert_eq!(index.len(), 5);
        assert_eq!(index.path("B2"), Some(&vec![1, 1]));
        assert_eq!(index.path("zzz"), None);
    }

    #[test]
    fn test_ui_flag_setters() {
        let tree = abc();
        let next = set_expanded(&tree, "B", true).unwrap();
        let next = set_selected(&next, "B1", true).unwrap();
        assert!(next.get(&[1]).unwrap().is_expanded());
        assert!(next.get(&[1, 0]).unwrap().is_selected());
        assert!(!next.get(&[1, 1]).unwrap().is_selected());

        let mut fresh = Step::blank("N");
        fresh.is_newly_inserted = true;
        let next = insert(&next, &[], 0, fresh).unwrap();
        let next = clear_newly_inserted(&next, "N").unwrap();
        assert!(!next.get(&[0]).unwrap().is_newly_inserted());

        assert_eq!(
            set_expanded(&tree, "nope", true),
            Err(TreeError::StepNotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_insert_under_deleting_parent() {
        let tree = mark_deleting(&abc(), "B").unwrap();
        assert_eq!(
            insert(&tree, &[1], 0, Step::blank("x")),
            Err(TreeError::StepDeleting("B".to_string()))
        );
    }
}
