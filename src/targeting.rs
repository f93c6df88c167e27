//! Drag-insert targeting
//!
//! While a new step is being dragged over the canvas, the live pointer
//! position decides where the step would land. Two tiers are evaluated:
//!
//! 1. leaf adoption: a pointer just below a childless step adopts the new
//!    step as that leaf's first child;
//! 2. sibling slots: otherwise the closest before / centre / after slot of any
//!    nearby step wins.

use serde::{Deserialize, Serialize};

use crate::layout::{NodeBox, Point};
use crate::models::{Step, StepPath, StepTree, TreeError};
use crate::tree;

/// Hit-testing tolerances, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DragConfig {
    /// Size of the window around a step within which its slots are considered
    pub tolerance: f64,
    /// Height of the band below a leaf that adopts the dragged step
    pub vertical_threshold: f64,
}

impl Default for DragConfig {
    fn default() -> Self {
        Self {
            tolerance: 100.0,
            vertical_threshold: 100.0,
        }
    }
}

/// Where a dropped step would be inserted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertTarget {
    pub parent: StepPath,
    pub index: usize,
}

impl InsertTarget {
    pub fn new(parent: StepPath, index: usize) -> Self {
        Self { parent, index }
    }

    /// The first position at the root level, used when the tree is empty
    pub fn root_start() -> Self {
        Self::new(Vec::new(), 0)
    }
}

fn leaf_adoption(boxes: &[NodeBox], pointer: Point, config: &DragConfig) -> Option<InsertTarget> {
    boxes
        .iter()
        .filter(|b| b.child_count == 0)
        .find(|b| {
            let bottom = b.rect.bottom();
            pointer.y >= bottom
                && pointer.y <= bottom + config.vertical_threshold
                && (pointer.x - b.rect.mid_x()).abs() <= config.tolerance
        })
        .map(|b| InsertTarget::new(b.path.clone(), 0))
}

fn closest_slot(boxes: &[NodeBox], pointer: Point, config: &DragConfig) -> Option<InsertTarget> {
    let mut best: Option<(f64, InsertTarget)> = None;

    for node in boxes {
        if !node.rect.expand(config.tolerance).contains(pointer) {
            continue;
        }
        let Some((&idx, parent)) = node.path.split_last() else {
            continue;
        };

        let y = node.rect.mid_y();
        let slots = [
            (node.rect.x, idx),
            (node.rect.mid_x(), idx),
            (node.rect.right(), idx + 1),
        ];

        for (x, index) in slots {
            let distance = pointer.distance(Point::new(x, y));
            // strict comparison keeps the first slot found on ties
            if best.as_ref().map_or(true, |(d, _)| distance < *d) {
                best = Some((distance, InsertTarget::new(parent.to_vec(), index)));
            }
        }
    }

    best.map(|(_, target)| target)
}

/// Decides where a step dropped at `pointer` would be inserted.
///
/// `boxes` are the rendered steps in render order. Steps in a removal
/// transition are ignored. Returns `None` when no slot is within tolerance.
pub fn find_insert_target(
    boxes: &[NodeBox],
    pointer: Point,
    config: &DragConfig,
) -> Option<InsertTarget> {
    let live: Vec<NodeBox> = boxes.iter().filter(|b| !b.deleting).cloned().collect();
    if live.is_empty() {
        return Some(InsertTarget::root_start());
    }

    leaf_adoption(&live, pointer, config).or_else(|| closest_slot(&live, pointer, config))
}

/// Result of releasing a dragged step
#[derive(Debug, Clone, PartialEq)]
pub enum DropOutcome {
    /// The step was inserted at `target`
    Committed { tree: StepTree, target: InsertTarget },
    /// No target was set; the ghost step is discarded
    Discarded,
}

/// An in-progress drag of a new step
#[derive(Debug, Clone)]
pub struct DragSession {
    ghost: Step,
    target: Option<InsertTarget>,
    config: DragConfig,
}

impl DragSession {
    /// Starts dragging `step`, which is shown as a ghost until dropped
    pub fn start(mut step: Step, config: DragConfig) -> Self {
        step.is_ghost = true;
        step.is_newly_inserted = true;
        Self {
            ghost: step,
            target: None,
            config,
        }
    }

    pub fn ghost(&self) -> &Step {
        &self.ghost
    }

    pub fn target(&self) -> Option<&InsertTarget> {
        self.target.as_ref()
    }

    /// Re-targets the drag for a new pointer position
    pub fn pointer_moved(&mut self, boxes: &[NodeBox], pointer: Point) -> Option<&InsertTarget> {
        self.target = find_insert_target(boxes, pointer, &self.config);
        self.target.as_ref()
    }

    /// The tree with the ghost step shown at the current target
    pub fn preview(&self, tree: &StepTree) -> Option<StepTree> {
        let target = self.target.as_ref()?;
        tree::splice(tree, &target.parent, target.index, self.ghost.clone()).ok()
    }

    /// Drops the step: inserts it at the current target, or discards it
    pub fn drop(self, tree: &StepTree) -> Result<DropOutcome, TreeError> {
        match self.target {
            Some(target) => {
                let tree = tree::insert(tree, &target.parent, target.index, self.ghost)?;
                Ok(DropOutcome::Committed { tree, target })
            }
            None => Ok(DropOutcome::Discarded),
        }
    }

    /// Escape: abandons the drag regardless of the current target
    pub fn cancel(self) -> DropOutcome {
        DropOutcome::Discarded
    }
}
