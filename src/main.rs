use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use nalgebra::Vector3;
use tracing::{info, warn};

use rust_vio::camera::{CameraModel, PinholeCamera};
use rust_vio::config::Config;
use rust_vio::io::EurocDataset;
use rust_vio::pipeline::Pipeline;
use rust_vio::tracker::KltTracker;

/// EuRoC MAV cam0/cam1 nominal pinhole intrinsics (undistorted replay).
const FX: f64 = 458.654;
const FY: f64 = 457.296;
const CX: f64 = 367.215;
const CY: f64 = 248.375;
const WIDTH: u32 = 752;
const HEIGHT: u32 = 480;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let dataset_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "data/euroc/MH_01_easy/mav0".to_string());
    let dataset = EurocDataset::new(&dataset_path)?;
    info!(
        frames = dataset.len(),
        imu_samples = dataset.imu_entries.len(),
        "dataset loaded"
    );

    let config = Arc::new(Config {
        focal_length: FX,
        tic: vec![Vector3::zeros(), Vector3::new(0.11, 0.0, 0.0)],
        ..Config::default()
    });

    let cameras: Vec<Box<dyn CameraModel>> = vec![
        Box::new(PinholeCamera::new(FX, FY, CX, CY, WIDTH, HEIGHT)),
        Box::new(PinholeCamera::new(FX, FY, CX, CY, WIDTH, HEIGHT)),
    ];
    let tracker = KltTracker::with_cameras(
        config.max_feature_count,
        config.min_feature_distance,
        config.flow_back,
        cameras,
    );

    let (mut pipeline, bus) = Pipeline::new(config, Box::new(tracker), None)?;

    let mut imu_cursor = 0;
    for i in 0..dataset.len() {
        let pair = match dataset.stereo_pair(i) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(frame = i, error = %e, "skipping unreadable stereo pair");
                continue;
            }
        };

        // Replay every IMU sample up to this frame first.
        while imu_cursor < dataset.imu_entries.len()
            && dataset.imu_entries[imu_cursor].timestamp_s <= pair.timestamp_s
        {
            let s = &dataset.imu_entries[imu_cursor];
            pipeline.input_imu(s.timestamp_s, s.accel, s.gyro);
            imu_cursor += 1;
        }

        pipeline.input_image(pair.timestamp_s, &pair.left, Some(&pair.right))?;

        while let Ok(odom) = bus.odometry.try_recv() {
            if imu_cursor % 400 == 0 {
                info!(
                    t = odom.timestamp,
                    p = ?odom.position,
                    "odometry"
                );
            }
        }
        while let Ok(kf) = bus.keyframe.try_recv() {
            info!(t = kf.timestamp, points = kf.points.len(), "keyframe");
        }
    }

    // Let the process thread drain the queues before shutting down.
    std::thread::sleep(Duration::from_millis(500));
    pipeline.shutdown();
    info!("replay finished");
    Ok(())
}
