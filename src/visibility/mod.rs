//! Per-frame node selection.
//!
//! All octrees share one priority queue ordered by on-screen weight. Popped
//! nodes are culled against the view frustum, the level limit and the clip
//! volumes, then admitted against the point budget. Admitted nodes that are
//! resident queue their children, the others are reported for loading.

pub mod frustum;
pub mod texture;

use crate::config::StreamingConfig;
use crate::octree::aabb::Aabb;
use crate::octree::node::{LoadState, OctreeNode};
use crate::octree::{FlatOctree, NodeId, NodeKey, OctreeId};
use frustum::Frustum;
use glam::{DMat4, DQuat, DVec3};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    /// Vertical field of view in radians.
    Perspective { fov_y: f64 },
    Orthographic,
}

/// Camera state of one frame, in world space.
#[derive(Clone, Copy, Debug)]
pub struct ViewState {
    pub camera_position: DVec3,
    pub view_projection: DMat4,
    pub projection: Projection,
    pub screen_width: f64,
    pub screen_height: f64,
}

impl ViewState {
    pub fn perspective_look_at(
        eye: DVec3,
        target: DVec3,
        up: DVec3,
        fov_y: f64,
        screen_width: f64,
        screen_height: f64,
    ) -> Self {
        let aspect = screen_width / screen_height.max(1.0);
        let projection = DMat4::perspective_rh(fov_y, aspect, 0.1, 1.0e7);
        let view = DMat4::look_at_rh(eye, target, up);
        Self {
            camera_position: eye,
            view_projection: projection * view,
            projection: Projection::Perspective { fov_y },
            screen_width,
            screen_height,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClipTask {
    #[default]
    None,
    /// Volumes only tint points, nothing is culled.
    Highlight,
    ShowInside,
    ShowOutside,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClipMethod {
    #[default]
    InsideAny,
    InsideAll,
}

/// Oriented box: the unit cube `[-0.5, 0.5]^3` mapped to world space by `transform`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipVolume {
    pub transform: DMat4,
}

impl ClipVolume {
    pub fn new(center: DVec3, size: DVec3, rotation: DQuat) -> Self {
        Self {
            transform: DMat4::from_scale_rotation_translation(size, rotation, center),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClipSettings {
    pub task: ClipTask,
    pub method: ClipMethod,
    pub volumes: Vec<ClipVolume>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VisibilitySettings {
    pub point_budget: u64,
    pub min_node_pixel_size: f64,
    pub max_level: Option<u32>,
    pub max_nodes_per_frame: Option<usize>,
    /// Most nodes reported for loading.
    pub max_loads: usize,
}

impl From<&StreamingConfig> for VisibilitySettings {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            point_budget: config.point_budget,
            min_node_pixel_size: config.min_node_pixel_size,
            max_level: config.max_level,
            max_nodes_per_frame: config.max_nodes_per_frame,
            max_loads: config.max_nodes_loading,
        }
    }
}

/// One octree taking part in the traversal.
#[derive(Clone, Copy)]
pub struct OctreeView<'a> {
    pub id: OctreeId,
    pub tree: &'a FlatOctree<OctreeNode>,
    /// World position of the octree's local origin.
    pub offset: DVec3,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OctreeStats {
    pub num_visible_points: u64,
    pub visible_nodes: usize,
    pub deepest_visible_level: u32,
}

#[derive(Clone, Debug, Default)]
pub struct VisibilityResult {
    /// Visible resident nodes, highest priority first.
    pub visible: Vec<NodeKey>,
    /// Visible nodes without geometry, highest priority first.
    pub to_load: Vec<NodeKey>,
    /// Visible nodes whose load is already under way.
    pub loading: Vec<NodeKey>,
    pub num_visible_points: u64,
    pub deepest_level: u32,
    pub lowest_spacing: f64,
    pub nodes_touched: usize,
    /// Share of the touched nodes that did not wait for geometry.
    pub loading_progress: f64,
    pub budget_exhausted: bool,
    pub octrees: HashMap<OctreeId, OctreeStats>,
}

/// Running visible-point total. Once a node does not fit, nothing after it does.
#[derive(Debug)]
struct BudgetGate {
    budget: u64,
    used: u64,
    exhausted: bool,
}

impl BudgetGate {
    fn new(budget: u64) -> Self {
        Self {
            budget,
            used: 0,
            exhausted: false,
        }
    }

    fn admit(&mut self, points: u64) -> bool {
        if self.exhausted || self.used + points > self.budget {
            self.exhausted = true;
            return false;
        }
        self.used += points;
        true
    }
}

#[derive(Debug)]
struct QueueEntry {
    weight: f64,
    seq: u64,
    octree: usize,
    node: NodeId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // heavier first, then first come first served
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .total_cmp(&other.weight)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Culling state of one octree, in its local frame.
struct LocalView {
    frustum: Frustum,
    camera: DVec3,
    clip_volumes: Vec<Frustum>,
}

impl LocalView {
    fn new(view: &ViewState, clip: &ClipSettings, offset: DVec3) -> Self {
        let world_from_local = DMat4::from_translation(offset);
        let local_from_world = DMat4::from_translation(-offset);
        Self {
            frustum: Frustum::from_view_projection(&(view.view_projection * world_from_local)),
            camera: view.camera_position - offset,
            clip_volumes: clip
                .volumes
                .iter()
                .map(|volume| Frustum::from_box_transform(&(local_from_world * volume.transform)))
                .collect(),
        }
    }

    fn clip_rejects(&self, clip: &ClipSettings, bounding_box: &Aabb) -> bool {
        if self.clip_volumes.is_empty() {
            return false;
        }
        let mut volumes = self.clip_volumes.iter();
        match (clip.task, clip.method) {
            (ClipTask::None | ClipTask::Highlight, _) => false,
            (ClipTask::ShowInside, ClipMethod::InsideAny) => {
                !volumes.any(|v| v.intersects_aabb(bounding_box))
            }
            (ClipTask::ShowInside, ClipMethod::InsideAll) => {
                !volumes.all(|v| v.intersects_aabb(bounding_box))
            }
            // only boxes entirely hidden by the volumes can go
            (ClipTask::ShowOutside, ClipMethod::InsideAny) => {
                volumes.any(|v| v.contains_aabb(bounding_box))
            }
            (ClipTask::ShowOutside, ClipMethod::InsideAll) => {
                volumes.all(|v| v.contains_aabb(bounding_box))
            }
        }
    }
}

/// Priority of a node, or `None` if it is too small on screen to be worth visiting.
pub fn node_weight(view: &ViewState, camera: DVec3, bounding_box: &Aabb, min_node_pixel_size: f64) -> Option<f64> {
    match view.projection {
        Projection::Perspective { fov_y } => {
            let (center, radius) = bounding_box.bounding_sphere();
            let distance = center.distance(camera);
            if distance - radius < 0.0 {
                return Some(f64::INFINITY);
            }
            let slope = (fov_y / 2.0).tan();
            let projection_factor = (0.5 * view.screen_height) / (slope * distance);
            let screen_pixel_radius = radius * projection_factor;
            if screen_pixel_radius < min_node_pixel_size {
                return None;
            }
            Some(screen_pixel_radius)
        }
        Projection::Orthographic => Some(bounding_box.diagonal()),
    }
}

/// Selects the nodes to show and to load for one frame.
pub fn update_visibility(
    octrees: &[OctreeView<'_>],
    view: &ViewState,
    clip: &ClipSettings,
    settings: &VisibilitySettings,
) -> VisibilityResult {
    let mut result = VisibilityResult {
        lowest_spacing: f64::INFINITY,
        ..Default::default()
    };
    let mut budget = BudgetGate::new(settings.point_budget);
    let mut queue = BinaryHeap::new();
    let mut seq = 0u64;
    let mut waiting = 0usize;

    let locals: Vec<LocalView> = octrees
        .iter()
        .map(|octree| LocalView::new(view, clip, octree.offset))
        .collect();

    for (index, octree) in octrees.iter().enumerate() {
        result.octrees.insert(octree.id, OctreeStats::default());
        if octree.tree.root().is_some() {
            queue.push(QueueEntry {
                weight: f64::INFINITY,
                seq,
                octree: index,
                node: octree.tree.root_id(),
            });
            seq += 1;
        }
    }

    while let Some(entry) = queue.pop() {
        if settings
            .max_nodes_per_frame
            .is_some_and(|max| result.nodes_touched >= max)
        {
            break;
        }
        result.nodes_touched += 1;

        let octree = &octrees[entry.octree];
        let local = &locals[entry.octree];
        let Some(node) = octree.tree.node(entry.node) else {
            continue;
        };
        let key = NodeKey::new(octree.id, entry.node);

        result.lowest_spacing = result.lowest_spacing.min(node.spacing);

        let visible = local.frustum.intersects_aabb(&node.bounding_box)
            && settings.max_level.map_or(true, |max| node.level <= max)
            && !local.clip_rejects(clip, &node.bounding_box)
            && node.state != LoadState::Failed;
        if !visible {
            continue;
        }
        if !budget.admit(node.num_points as u64) {
            continue;
        }

        let stats = result.octrees.entry(octree.id).or_default();
        stats.num_visible_points += node.num_points as u64;

        if !node.is_loaded() {
            waiting += 1;
            if node.state == LoadState::Unloaded {
                result.to_load.push(key);
            } else {
                result.loading.push(key);
            }
            continue;
        }

        stats.visible_nodes += 1;
        stats.deepest_visible_level = stats.deepest_visible_level.max(node.level);
        result.deepest_level = result.deepest_level.max(node.level);
        result.visible.push(key);

        for (_, child_id) in node.child_ids() {
            let Some(child) = octree.tree.node(child_id) else {
                continue;
            };
            let Some(weight) =
                node_weight(view, local.camera, &child.bounding_box, settings.min_node_pixel_size)
            else {
                continue;
            };
            queue.push(QueueEntry {
                weight,
                seq,
                octree: entry.octree,
                node: child_id,
            });
            seq += 1;
        }
    }

    result.num_visible_points = budget.used;
    result.budget_exhausted = budget.exhausted;
    result.loading_progress = if result.nodes_touched == 0 {
        1.0
    } else {
        (result.nodes_touched - waiting) as f64 / result.nodes_touched as f64
    };
    result.to_load.truncate(settings.max_loads);

    trace!(
        visible = result.visible.len(),
        points = result.num_visible_points,
        touched = result.nodes_touched,
        to_load = result.to_load.len(),
        "updated visibility"
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::aabb::create_child_aabb;
    use crate::octree::node::child_name;

    /// Root `[0,8]^3` with eight children, all resident unless said otherwise.
    fn tree(root_points: u32, child_points: [u32; 8]) -> FlatOctree<OctreeNode> {
        let root_box = Aabb::new(DVec3::ZERO, DVec3::splat(8.0));
        let mut tree = FlatOctree::with_root(OctreeNode {
            name: "r".to_string(),
            bounding_box: root_box,
            spacing: 1.0,
            num_points: root_points,
            child_mask: 0xff,
            state: LoadState::Loaded,
            ..Default::default()
        });
        let root_id = tree.root_id();
        for (index, &points) in child_points.iter().enumerate() {
            let id = tree.insert(OctreeNode {
                name: child_name("r", index),
                index: index as u8,
                level: 1,
                bounding_box: create_child_aabb(&root_box, index),
                spacing: 0.5,
                num_points: points,
                parent: Some(root_id),
                state: LoadState::Loaded,
                ..Default::default()
            });
            if let Some(root) = tree.node_mut(root_id) {
                root.children[index] = Some(id);
            }
        }
        tree
    }

    fn view() -> ViewState {
        ViewState::perspective_look_at(
            DVec3::splat(-20.0),
            DVec3::splat(4.0),
            DVec3::Z,
            60f64.to_radians(),
            1000.0,
            1000.0,
        )
    }

    fn settings() -> VisibilitySettings {
        VisibilitySettings {
            point_budget: 1_000_000,
            min_node_pixel_size: 10.0,
            max_level: None,
            max_nodes_per_frame: None,
            max_loads: 4,
        }
    }

    fn names(tree: &FlatOctree<OctreeNode>, keys: &[NodeKey]) -> Vec<String> {
        keys.iter()
            .map(|key| tree.node(key.node).unwrap().name.clone())
            .collect()
    }

    fn run(tree: &FlatOctree<OctreeNode>, clip: &ClipSettings, settings: &VisibilitySettings) -> VisibilityResult {
        let octrees = [OctreeView {
            id: OctreeId(0),
            tree,
            offset: DVec3::ZERO,
        }];
        update_visibility(&octrees, &view(), clip, settings)
    }

    #[test]
    fn test_nearest_children_come_first() {
        let tree = tree(10, [10; 8]);
        let result = run(&tree, &ClipSettings::default(), &settings());

        let visible = names(&tree, &result.visible);
        assert_eq!(visible.len(), 9);
        assert_eq!(visible[0], "r");
        assert_eq!(visible[1], "r0");
        // one step away from the camera, ties keep octant order
        assert_eq!(&visible[2..5], ["r1", "r2", "r4"]);
        assert_eq!(visible[8], "r7");
        assert_eq!(result.num_visible_points, 90);
        assert_eq!(result.deepest_level, 1);
        assert_eq!(result.lowest_spacing, 0.5);
        assert_eq!(result.loading_progress, 1.0);
    }

    #[test]
    fn test_point_budget_in_priority_order() {
        let tree = tree(10, [10, 10, 10, 0, 5, 0, 0, 0]);
        let settings = VisibilitySettings {
            point_budget: 40,
            ..settings()
        };
        let result = run(&tree, &ClipSettings::default(), &settings);

        // exactly on budget is accepted, everything after the first miss is dropped
        assert_eq!(names(&tree, &result.visible), ["r", "r0", "r1", "r2"]);
        assert_eq!(result.num_visible_points, 40);
        assert!(result.budget_exhausted);
        assert_eq!(result.nodes_touched, 9);
    }

    #[test]
    fn test_small_nodes_are_not_visited() {
        let tree = tree(10, [10; 8]);
        let settings = VisibilitySettings {
            min_node_pixel_size: 72.0,
            ..settings()
        };
        let result = run(&tree, &ClipSettings::default(), &settings);
        assert_eq!(names(&tree, &result.visible), ["r", "r0", "r1", "r2", "r4"]);
        assert_eq!(result.nodes_touched, 5);
    }

    #[test]
    fn test_unloaded_nodes_are_requested_not_descended() {
        let mut tree = tree(10, [10; 8]);
        let root_id = tree.root_id();
        tree.node_mut(root_id).unwrap().state = LoadState::Unloaded;

        let result = run(&tree, &ClipSettings::default(), &settings());
        assert!(result.visible.is_empty());
        assert_eq!(names(&tree, &result.to_load), ["r"]);
        assert_eq!(result.nodes_touched, 1);
        assert_eq!(result.num_visible_points, 10);
        assert_eq!(result.loading_progress, 0.0);
    }

    #[test]
    fn test_loading_nodes_are_not_requested_twice() {
        let mut tree = tree(10, [10; 8]);
        let ids: Vec<NodeId> = tree.iter().filter(|(_, n)| n.level == 1).map(|(id, _)| id).collect();
        tree.node_mut(ids[0]).unwrap().state = LoadState::Loading;
        for &id in &ids[1..] {
            tree.node_mut(id).unwrap().state = LoadState::Unloaded;
        }

        let result = run(&tree, &ClipSettings::default(), &settings());
        assert_eq!(names(&tree, &result.visible), ["r"]);
        // capped to the load slots, without r0 which is already loading
        assert_eq!(names(&tree, &result.to_load), ["r1", "r2", "r4", "r3"]);
        assert_eq!(names(&tree, &result.loading), ["r0"]);
    }

    #[test]
    fn test_level_and_visit_limits() {
        let tree = tree(10, [10; 8]);
        let capped = VisibilitySettings {
            max_level: Some(0),
            ..settings()
        };
        assert_eq!(names(&tree, &run(&tree, &ClipSettings::default(), &capped).visible), ["r"]);

        let limited = VisibilitySettings {
            max_nodes_per_frame: Some(2),
            ..settings()
        };
        let result = run(&tree, &ClipSettings::default(), &limited);
        assert_eq!(result.nodes_touched, 2);
        assert_eq!(names(&tree, &result.visible), ["r", "r0"]);
    }

    #[test]
    fn test_nodes_outside_the_frustum() {
        let tree = tree(10, [10; 8]);
        let away = ViewState::perspective_look_at(
            DVec3::splat(-20.0),
            DVec3::splat(-40.0),
            DVec3::Z,
            60f64.to_radians(),
            1000.0,
            1000.0,
        );
        let octrees = [OctreeView {
            id: OctreeId(0),
            tree: &tree,
            offset: DVec3::ZERO,
        }];
        let result = update_visibility(&octrees, &away, &ClipSettings::default(), &settings());
        assert!(result.visible.is_empty());
        assert_eq!(result.nodes_touched, 1);
    }

    #[test]
    fn test_clip_show_inside() {
        let tree = tree(10, [10; 8]);
        let clip = ClipSettings {
            task: ClipTask::ShowInside,
            method: ClipMethod::InsideAny,
            volumes: vec![ClipVolume::new(DVec3::splat(1.5), DVec3::splat(3.0), DQuat::IDENTITY)],
        };
        let result = run(&tree, &clip, &settings());
        assert_eq!(names(&tree, &result.visible), ["r", "r0"]);

        let highlight = ClipSettings {
            task: ClipTask::Highlight,
            ..clip
        };
        assert_eq!(run(&tree, &highlight, &settings()).visible.len(), 9);
    }

    #[test]
    fn test_clip_show_outside() {
        let tree = tree(10, [10; 8]);
        let everything = ClipSettings {
            task: ClipTask::ShowOutside,
            method: ClipMethod::InsideAny,
            volumes: vec![ClipVolume::new(DVec3::splat(4.0), DVec3::splat(10.0), DQuat::IDENTITY)],
        };
        assert!(run(&tree, &everything, &settings()).visible.is_empty());

        // only r7 lies entirely inside the volume
        let corner = ClipSettings {
            volumes: vec![ClipVolume::new(DVec3::splat(6.0), DVec3::splat(5.0), DQuat::IDENTITY)],
            ..everything
        };
        let visible = names(&tree, &run(&tree, &corner, &settings()).visible);
        assert_eq!(visible.len(), 8);
        assert!(!visible.contains(&"r7".to_string()));
    }

    #[test]
    fn test_octrees_share_the_budget() {
        let near = tree(10, [0; 8]);
        let far = tree(10, [0; 8]);
        let octrees = [
            OctreeView {
                id: OctreeId(0),
                tree: &near,
                offset: DVec3::ZERO,
            },
            OctreeView {
                id: OctreeId(1),
                tree: &far,
                offset: DVec3::new(0.0, 0.0, 4.0),
            },
        ];
        let settings = VisibilitySettings {
            point_budget: 10,
            ..settings()
        };
        let result = update_visibility(&octrees, &view(), &ClipSettings::default(), &settings);
        assert_eq!(result.octrees[&OctreeId(0)].num_visible_points, 10);
        assert_eq!(result.octrees[&OctreeId(1)].num_visible_points, 0);
        assert_eq!(result.visible.iter().filter(|k| k.octree == OctreeId(1)).count(), 0);
    }
}
