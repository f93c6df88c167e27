//! Tree layout calculator
//!
//! Computes the horizontal footprint of every subtree so siblings can be laid
//! out without overlap, plus the positioned boxes used for drag targeting.
//! Coordinates are pixels with the origin at the top-left of the canvas.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{Step, StepPath, StepTree};

/// Sizes and gaps used when laying out a tree
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub box_width: f64,
    pub box_height: f64,
    /// Horizontal gap between sibling subtrees
    pub child_gap: f64,
    /// Vertical gap between a parent row and its children
    pub level_gap: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            box_width: 240.0,
            box_height: 80.0,
            child_gap: 40.0,
            level_gap: 60.0,
        }
    }
}

/// A point in canvas space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// An axis-aligned rectangle in canvas space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn mid_x(&self) -> f64 {
        self.x + self.width / 2.0
    }

    pub fn mid_y(&self) -> f64 {
        self.y + self.height / 2.0
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x <= self.right() && p.y >= self.y && p.y <= self.bottom()
    }

    /// Grows the rectangle by `margin` on every side
    pub fn expand(&self, margin: f64) -> Rect {
        Rect {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + 2.0 * margin,
            height: self.height + 2.0 * margin,
        }
    }
}

/// Total horizontal footprint of a step and its subtree
pub fn subtree_width(step: &Step, config: &LayoutConfig) -> f64 {
    if step.is_leaf() {
        return config.box_width;
    }

    let children = step.children();
    let sum: f64 = children.iter().map(|c| subtree_width(c, config)).sum();
    sum + (children.len() - 1) as f64 * config.child_gap
}

/// Horizontal offset that centres a parent's connector over its children
pub fn connector_offset(own_width: f64, config: &LayoutConfig) -> f64 {
    (own_width - config.box_width + config.child_gap) / 2.0
}

/// The horizontal line joining a parent's children, relative to the parent's footprint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BranchSpan {
    pub start: f64,
    pub end: f64,
}

/// Computes the branch line under a step; leaves have none
pub fn branch_span(step: &Step, config: &LayoutConfig) -> Option<BranchSpan> {
    let first = step.children().first()?;
    let last = step.children().last()?;
    let own = subtree_width(step, config);
    Some(BranchSpan {
        start: subtree_width(first, config) / 2.0,
        end: own - subtree_width(last, config) / 2.0,
    })
}

/// Memoised subtree widths keyed by node identity.
///
/// Edits copy the steps along the edited path, so a changed subtree always has
/// a new allocation. The cache holds on to each measured `Arc` so an address
/// cannot be reused by a different step while it is cached.
#[derive(Debug, Default)]
pub struct LayoutCache {
    config: LayoutConfig,
    widths: HashMap<usize, (Arc<Step>, f64)>,
}

impl LayoutCache {
    pub fn new(config: LayoutConfig) -> Self {
        Self {
            config,
            widths: HashMap::new(),
        }
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    pub fn width(&mut self, step: &Arc<Step>) -> f64 {
        let key = Arc::as_ptr(step) as usize;
        if let Some((_, width)) = self.widths.get(&key) {
            return *width;
        }

        let width = if step.is_leaf() {
            self.config.box_width
        } else {
            let children = step.children();
            let mut sum = 0.0;
            for child in children {
                sum += self.width(child);
            }
            sum + (children.len() - 1) as f64 * self.config.child_gap
        };

        self.widths.insert(key, (Arc::clone(step), width));
        width
    }

    pub fn len(&self) -> usize {
        self.widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }

    pub fn clear(&mut self) {
        self.widths.clear();
    }
}

/// A rendered step with its position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBox {
    pub id: String,
    pub path: StepPath,
    pub rect: Rect,
    /// Children not in a removal transition
    pub child_count: usize,
    pub deleting: bool,
    /// Branch line joining the children, in canvas coordinates
    pub branch: Option<BranchSpan>,
}

/// Positions every step of the tree, in pre-order.
///
/// Top-level steps are laid out left to right separated by `child_gap`; each
/// parent box is centred over the footprint of its children.
pub fn layout_tree(tree: &StepTree, config: &LayoutConfig) -> Vec<NodeBox> {
    layout_with(tree, &mut LayoutCache::new(*config))
}

/// Same as [`layout_tree`], reusing widths measured by earlier layouts
pub fn layout_with(tree: &StepTree, cache: &mut LayoutCache) -> Vec<NodeBox> {
    fn place(
        step: &Arc<Step>,
        path: StepPath,
        left: f64,
        depth: usize,
        cache: &mut LayoutCache,
        out: &mut Vec<NodeBox>,
    ) -> f64 {
        let config = *cache.config();
        let own = cache.width(step);
        let y = depth as f64 * (config.box_height + config.level_gap);
        let branch = match (step.children().first(), step.children().last()) {
            (Some(first), Some(last)) => Some(BranchSpan {
                start: left + cache.width(first) / 2.0,
                end: left + own - cache.width(last) / 2.0,
            }),
            _ => None,
        };
        out.push(NodeBox {
            id: step.id().to_string(),
            path: path.clone(),
            rect: Rect::new(
                left + (own - config.box_width) / 2.0,
                y,
                config.box_width,
                config.box_height,
            ),
            child_count: step.live_children().count(),
            deleting: step.is_deleting(),
            branch,
        });

        let mut child_left = left;
        for (i, child) in step.children().iter().enumerate() {
            let mut child_path = path.clone();
            child_path.push(i);
            let width = place(child, child_path, child_left, depth + 1, cache, out);
            child_left += width + config.child_gap;
        }
        own
    }

    let gap = cache.config().child_gap;
    let mut out = Vec::with_capacity(tree.len());
    let mut left = 0.0;
    for (i, step) in tree.roots().iter().enumerate() {
        let width = place(step, vec![i], left, 0, cache, &mut out);
        left += width + gap;
    }
    out
}
