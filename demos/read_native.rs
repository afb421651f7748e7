use glam::DVec3;
use potree_streaming::prelude::*;
use potree_streaming::resource::file::FileClient;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "assets/lion_takanawa/cloud.js".to_string());
    let url = format!("file://{}", path);

    let spawner = Arc::new(tokio::runtime::Handle::current());
    let mut session = StreamingSession::new(FileClient, StreamingConfig::default(), spawner, NullSink);
    let id = match session.open_octree(&url).await {
        Ok(id) => id,
        Err(error) => {
            eprintln!("Could not open {}: {}", url, error);
            return;
        }
    };

    let cloud = session.octree(id).unwrap();
    let metadata = cloud.metadata();
    println!(
        "Opened {} (version {}, {} points, {} nodes in the root hierarchy)",
        url,
        metadata.version,
        metadata.points,
        cloud.octree().len()
    );

    let root = cloud.octree().root().unwrap();
    let bounds = cloud.world_bounding_box(root);
    let center = bounds.center();
    let eye = center + DVec3::new(1.0, 1.0, 0.6) * bounds.diagonal();

    for frame in 0..50 {
        let view = ViewState::perspective_look_at(eye, center, DVec3::Z, 60f64.to_radians(), 1920.0, 1080.0);
        let result = session.update(&view, &ClipSettings::default());
        println!(
            "frame {:>2}: {} visible nodes, {} points, depth {}, progress {:.0}%",
            frame,
            result.visible.len(),
            result.num_visible_points,
            result.deepest_level,
            result.loading_progress * 100.0
        );
        if result.to_load.is_empty() && result.loading.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stats = session.stats();
    println!("Resident: {} nodes, {} points", stats.resident_nodes, stats.resident_points);

    let snapshot = session.octree(id).unwrap().hierarchy_snapshot();
    for node in snapshot.iter().take(20) {
        println!(
            "{:indent$}{} ({} points, {:?})",
            "",
            node.name,
            node.num_points,
            node.state,
            indent = node.level as usize * 2
        );
    }
}
