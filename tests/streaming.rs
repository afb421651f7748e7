use futures::executor::{block_on, ThreadPool};
use glam::{DVec3, U8Vec4};
use potree_streaming::codec::binary::encode_records;
use potree_streaming::codec::las::LasPoint;
use potree_streaming::codec::laz::LasWriter;
use potree_streaming::codec::{AttributeArray, AttributeValues, PointBuffer};
use potree_streaming::hierarchy::{encode_hierarchy_chunk, HierarchyRecord};
use potree_streaming::octree::point_attributes::PointSchema;
use potree_streaming::point::world_points;
use potree_streaming::prelude::*;
use potree_streaming::resource::memory::MemoryClient;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PACKED_CLOUD: &str = r#"{
    "version": "1.7",
    "octreeDir": "data",
    "points": 5,
    "boundingBox": {"lx": 100.0, "ly": 100.0, "lz": 100.0, "ux": 108.0, "uy": 108.0, "uz": 108.0},
    "pointAttributes": ["POSITION_CARTESIAN", "COLOR_PACKED"],
    "spacing": 1.0,
    "scale": 0.001,
    "hierarchyStepSize": 5
}"#;

const LAZ_CLOUD: &str = r#"{
    "version": "1.7",
    "octreeDir": "data",
    "boundingBox": {"lx": 100.0, "ly": 100.0, "lz": 100.0, "ux": 108.0, "uy": 108.0, "uz": 108.0},
    "pointAttributes": "LAZ",
    "spacing": 1.0,
    "scale": 0.01,
    "hierarchyStepSize": 5
}"#;

#[derive(Default)]
struct RecordingSink {
    uploaded: Vec<NodeKey>,
    disposed: Vec<NodeKey>,
}

impl RenderSink for RecordingSink {
    type Handle = NodeKey;

    fn upload(&mut self, key: NodeKey, _buffer: &PointBuffer) -> NodeKey {
        self.uploaded.push(key);
        key
    }

    fn dispose(&mut self, key: NodeKey, handle: NodeKey) {
        assert_eq!(key, handle);
        self.disposed.push(key);
    }
}

fn packed(points: &[[f32; 3]]) -> Vec<u8> {
    let colors = points.iter().flat_map(|_| [10, 20, 30, 255]).collect();
    let buffer = PointBuffer::new(
        points.iter().flatten().copied().collect(),
        vec![AttributeArray::new(
            potree_streaming::octree::point_attributes::AttributeKind::Color,
            4,
            AttributeValues::U8(colors),
        )],
    )
    .unwrap();
    let schema = PointSchema::from_names(&["POSITION_CARTESIAN", "COLOR_PACKED"]).unwrap();
    // every node file is normalized to its own box, only the size matters
    encode_records(&schema, 0.001, DVec3::splat(8.0), &buffer).unwrap()
}

/// Root with children in octants 0 and 7.
fn packed_client() -> MemoryClient {
    let client = MemoryClient::new().with_piece_size(7);
    client.insert("mem://scan/cloud.js", PACKED_CLOUD.as_bytes().to_vec());
    client.insert(
        "mem://scan/data/r/r.hrc",
        encode_hierarchy_chunk(&[
            HierarchyRecord {
                child_mask: 0b1000_0001,
                num_points: 3,
            },
            HierarchyRecord {
                child_mask: 0,
                num_points: 1,
            },
            HierarchyRecord {
                child_mask: 0,
                num_points: 1,
            },
        ]),
    );
    client.insert(
        "mem://scan/data/r/r.bin",
        packed(&[[0.1, 0.1, 0.1], [0.9, 0.9, 0.9], [0.2, 0.3, 0.1]]),
    );
    client.insert("mem://scan/data/r/r0.bin", packed(&[[0.5, 0.5, 0.5]]));
    client.insert("mem://scan/data/r/r7.bin", packed(&[[0.25, 0.25, 0.25]]));
    client
}

fn config() -> StreamingConfig {
    StreamingConfig {
        min_node_pixel_size: 10.0,
        ..Default::default()
    }
}

fn session(client: MemoryClient, config: StreamingConfig) -> StreamingSession<MemoryClient, RecordingSink> {
    StreamingSession::new(
        client,
        config,
        Arc::new(ThreadPool::new().unwrap()),
        RecordingSink::default(),
    )
}

fn looking_at_cloud() -> ViewState {
    ViewState::perspective_look_at(
        DVec3::splat(90.0),
        DVec3::splat(104.0),
        DVec3::Z,
        60f64.to_radians(),
        1000.0,
        1000.0,
    )
}

fn looking_away() -> ViewState {
    ViewState::perspective_look_at(
        DVec3::splat(90.0),
        DVec3::splat(0.0),
        DVec3::Z,
        60f64.to_radians(),
        1000.0,
        1000.0,
    )
}

fn wait_idle<S: RenderSink>(session: &StreamingSession<MemoryClient, S>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while session.in_flight_count() > 0 {
        assert!(Instant::now() < deadline, "timed out waiting for loads");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Runs frames until nothing is left to load.
fn settle<S: RenderSink>(session: &mut StreamingSession<MemoryClient, S>, view: &ViewState) {
    for _ in 0..10 {
        let result = session.update(view, &ClipSettings::default());
        if result.to_load.is_empty() && result.loading.is_empty() {
            return;
        }
        wait_idle(session);
    }
    panic!("frames did not settle");
}

fn key_of(session: &StreamingSession<MemoryClient, RecordingSink>, id: OctreeId, name: &str) -> NodeKey {
    let (node, _) = session.octree(id).unwrap().node_by_name(name).unwrap();
    NodeKey::new(id, node)
}

#[test]
fn streams_nodes_top_down_and_inherits_parent_points() {
    let client = packed_client();
    let mut session = session(client.clone(), config());
    let id = block_on(session.open_octree("mem://scan/cloud.js")).unwrap();

    // the root is requested first, its children only once it is resident
    let first = session.update(&looking_at_cloud(), &ClipSettings::default());
    assert_eq!(first.to_load.len(), 1);
    assert!(first.visible.is_empty());
    wait_idle(&session);

    settle(&mut session, &looking_at_cloud());
    let result = session.last_result();
    assert_eq!(result.visible.len(), 3);
    assert_eq!(result.num_visible_points, 5);
    assert_eq!(result.deepest_level, 1);
    assert_eq!(result.loading_progress, 1.0);
    assert_eq!(result.visible[0], key_of(&session, id, "r"));

    for url in ["r.bin", "r0.bin", "r7.bin"] {
        assert_eq!(client.fetch_count(&format!("mem://scan/data/r/{}", url)), 1);
    }

    // r0 holds its own point followed by the two root points of octant 0
    let r0 = session.payload(&key_of(&session, id, "r0")).unwrap();
    assert_eq!(r0.buffer.num_points(), 3);
    let ranges = r0.buffer.octant_ranges().unwrap();
    assert_eq!(ranges.range(0).len(), 1);
    assert_eq!(ranges.range(2).len(), 1);
    assert_eq!(ranges.range(7).len(), 1);

    let cloud = session.octree(id).unwrap();
    let (_, node) = cloud.node_by_name("r0").unwrap();
    let world_box = cloud.world_bounding_box(node);
    let mut positions: Vec<DVec3> = world_points(&r0.buffer, &world_box).map(|p| p.position).collect();
    positions.sort_by(|a, b| a.x.total_cmp(&b.x));
    let expected = [
        DVec3::new(100.8, 100.8, 100.8),
        DVec3::new(101.6, 102.4, 100.8),
        DVec3::new(102.0, 102.0, 102.0),
    ];
    for (actual, expected) in positions.iter().zip(expected) {
        assert!(actual.distance(expected) < 1e-3, "{} != {}", actual, expected);
    }
    let colors: Vec<_> = world_points(&r0.buffer, &world_box).map(|p| p.color).collect();
    assert!(colors.iter().all(|c| *c == Some(U8Vec4::new(10, 20, 30, 255))));

    let texture = session.visibility_texture(id).unwrap();
    assert_eq!(texture.data, vec![0b1000_0001, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 1]);

    let snapshot = cloud.hierarchy_snapshot();
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.nodes.iter().all(|n| n.state == LoadState::Loaded));
}

#[test]
fn evicts_nodes_that_leave_the_view() {
    let config = StreamingConfig {
        cache_point_limit: 4,
        ..config()
    };
    let mut session = session(packed_client(), config);
    let id = block_on(session.open_octree("mem://scan/cloud.js")).unwrap();
    settle(&mut session, &looking_at_cloud());

    // everything on screen stays, even over budget
    assert_eq!(session.stats().resident_nodes, 3);
    assert!(session.sink().disposed.is_empty());

    session.update(&looking_away(), &ClipSettings::default());
    assert!(session.last_result().visible.is_empty());

    // the root is pinned, the children go
    let root = key_of(&session, id, "r");
    let mut disposed = session.sink().disposed.clone();
    disposed.sort();
    let mut children = vec![key_of(&session, id, "r0"), key_of(&session, id, "r7")];
    children.sort();
    assert_eq!(disposed, children);
    assert!(session.payload(&root).is_some());

    let cloud = session.octree(id).unwrap();
    assert_eq!(cloud.node_by_name("r0").unwrap().1.state, LoadState::Unloaded);
    assert_eq!(cloud.node_by_name("r").unwrap().1.state, LoadState::Loaded);

    // coming back reloads them
    settle(&mut session, &looking_at_cloud());
    assert_eq!(session.last_result().visible.len(), 3);
}

#[test]
fn point_budget_keeps_the_coarse_levels() {
    let config = StreamingConfig {
        point_budget: 4,
        ..config()
    };
    let mut session = session(packed_client(), config);
    block_on(session.open_octree("mem://scan/cloud.js")).unwrap();
    settle(&mut session, &looking_at_cloud());

    let result = session.last_result();
    assert_eq!(result.visible.len(), 2);
    assert_eq!(result.num_visible_points, 4);
    assert!(result.budget_exhausted);
}

fn laz_client() -> MemoryClient {
    let points: Vec<LasPoint> = [(101.0, 102.0, 103.0), (107.5, 100.5, 106.25)]
        .into_iter()
        .map(|(x, y, z): (f64, f64, f64)| LasPoint {
            x: (x / 0.01).round() as i32,
            y: (y / 0.01).round() as i32,
            z: (z / 0.01).round() as i32,
            intensity: 512,
            classification: 2,
            return_number: 1,
            number_of_returns: 1,
            color: [10 * 256, 20 * 256, 30 * 256],
            ..Default::default()
        })
        .collect();
    let laz = LasWriter::new(2, [0.01; 3], [0.0; 3])
        .compressed(50_000)
        .write(&points)
        .unwrap();

    let client = MemoryClient::new().with_piece_size(13);
    client.insert("mem://laz/cloud.js", LAZ_CLOUD.as_bytes().to_vec());
    client.insert(
        "mem://laz/data/r/r.hrc",
        encode_hierarchy_chunk(&[
            HierarchyRecord {
                child_mask: 0b0000_0010,
                num_points: 2,
            },
            HierarchyRecord {
                child_mask: 0,
                num_points: 1,
            },
        ]),
    );
    client.insert("mem://laz/data/r/r.laz", laz);
    client
}

#[test]
fn decodes_compressed_nodes_in_world_space() {
    let mut session = session(laz_client(), config());
    let id = block_on(session.open_octree("mem://laz/cloud.js")).unwrap();
    // r1 is corrupt: rejected for good, the root still renders
    session.scheduler().client().insert("mem://laz/data/r/r1.laz", vec![0; 300]);
    settle(&mut session, &looking_at_cloud());

    let root = key_of(&session, id, "r");
    assert_eq!(session.last_result().visible, vec![root]);
    let cloud = session.octree(id).unwrap();
    let (_, r1) = cloud.node_by_name("r1").unwrap();
    assert_eq!(r1.state, LoadState::Failed);
    assert_eq!(r1.load_error, Some(LoadErrorKind::Malformed));

    let payload = session.payload(&root).unwrap();
    let world_box = cloud.world_bounding_box(cloud.octree().root().unwrap());
    let points: Vec<PointData> = world_points(&payload.buffer, &world_box).collect();
    assert_eq!(points.len(), 2);
    let first = points
        .iter()
        .find(|p| p.position.distance(DVec3::new(101.0, 102.0, 103.0)) < 1e-3)
        .unwrap();
    assert_eq!(first.intensity, Some(512));
    assert_eq!(first.classification, Some(2));
    assert_eq!(first.color, Some(U8Vec4::new(10, 20, 30, 255)));

    // a rejected node is not asked for again
    session.update(&looking_at_cloud(), &ClipSettings::default());
    assert!(session.last_result().to_load.is_empty());
    assert_eq!(session.scheduler().client().fetch_count("mem://laz/data/r/r1.laz"), 1);
}
