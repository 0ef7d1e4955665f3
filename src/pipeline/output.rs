//! Published output streams.
//!
//! Every estimator product leaves through an unbounded channel; whatever
//! transport the application uses subscribes on the receiver side. Sends
//! never block and are dropped silently once the receiver is gone.

use crossbeam_channel::{unbounded, Receiver, Sender};
use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::SE3;

/// High-rate pose estimate from the fast-forward predictor or the window
/// tail.
#[derive(Debug, Clone)]
pub struct OdometryMsg {
    pub timestamp: f64,
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub velocity: Vector3<f64>,
}

/// Newest keyframe pose plus its triangulated features.
#[derive(Debug, Clone)]
pub struct KeyframeMsg {
    pub timestamp: f64,
    pub pose: SE3,
    pub points: Vec<Vector3<f64>>,
}

/// Camera extrinsics currently in use.
#[derive(Debug, Clone)]
pub struct CameraPoseMsg {
    pub timestamp: f64,
    pub poses: Vec<SE3>,
}

#[derive(Debug, Clone)]
pub struct PointCloudMsg {
    pub timestamp: f64,
    pub points: Vec<Vector3<f64>>,
}

#[derive(Debug, Clone)]
pub struct BiasMsg {
    pub timestamp: f64,
    pub accel_bias: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
}

/// Body-in-world transform at image rate.
#[derive(Debug, Clone)]
pub struct TfMsg {
    pub timestamp: f64,
    pub pose: SE3,
}

pub(crate) struct OutputSenders {
    pub odometry: Sender<OdometryMsg>,
    pub keyframe: Sender<KeyframeMsg>,
    pub camera_pose: Sender<CameraPoseMsg>,
    pub point_cloud: Sender<PointCloudMsg>,
    pub bias: Sender<BiasMsg>,
    pub tf: Sender<TfMsg>,
    pub depth_cloud: Sender<PointCloudMsg>,
}

/// Receiver side handed to the application.
pub struct OutputBus {
    pub odometry: Receiver<OdometryMsg>,
    pub keyframe: Receiver<KeyframeMsg>,
    pub camera_pose: Receiver<CameraPoseMsg>,
    pub point_cloud: Receiver<PointCloudMsg>,
    pub bias: Receiver<BiasMsg>,
    pub tf: Receiver<TfMsg>,
    pub depth_cloud: Receiver<PointCloudMsg>,
}

pub(crate) fn output_channels() -> (OutputSenders, OutputBus) {
    let (odometry_tx, odometry_rx) = unbounded();
    let (keyframe_tx, keyframe_rx) = unbounded();
    let (camera_pose_tx, camera_pose_rx) = unbounded();
    let (point_cloud_tx, point_cloud_rx) = unbounded();
    let (bias_tx, bias_rx) = unbounded();
    let (tf_tx, tf_rx) = unbounded();
    let (depth_cloud_tx, depth_cloud_rx) = unbounded();
    (
        OutputSenders {
            odometry: odometry_tx,
            keyframe: keyframe_tx,
            camera_pose: camera_pose_tx,
            point_cloud: point_cloud_tx,
            bias: bias_tx,
            tf: tf_tx,
            depth_cloud: depth_cloud_tx,
        },
        OutputBus {
            odometry: odometry_rx,
            keyframe: keyframe_rx,
            camera_pose: camera_pose_rx,
            point_cloud: point_cloud_rx,
            bias: bias_rx,
            tf: tf_rx,
            depth_cloud: depth_cloud_rx,
        },
    )
}
