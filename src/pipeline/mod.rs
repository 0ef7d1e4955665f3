//! Measurement pipeline: sensor queues, the process thread, the depth
//! thread, and the IMU fast-forward predictor.
//!
//! Producers (image and IMU callers) only touch the queues and the latest
//! fast-forward state under the buffer mutex; the heavy estimator state is
//! owned exclusively by the process thread. The depth thread pairs stereo
//! frames with window odometry under its own mutex.

pub mod output;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use opencv::core::Mat;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::depth::DepthEstimator;
use crate::estimator::{Estimator, MarginalizationFlag};
use crate::feature::FeatureFrame;
use crate::geometry::SE3;
use crate::tracker::FeatureTracker;
use output::{
    output_channels, BiasMsg, CameraPoseMsg, KeyframeMsg, OdometryMsg, OutputBus, OutputSenders,
    PointCloudMsg, TfMsg,
};

/// Process-thread idle sleep when the feature queue is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(2);
/// Poll interval while waiting for IMU coverage or odometry pairing.
const WAIT_SLEEP: Duration = Duration::from_millis(5);
/// Depth/odometry pairing tolerance, seconds.
const DEPTH_PAIR_TOL: f64 = 1e-3;

/// Open-loop IMU integration state from the newest keyframe to wall time.
#[derive(Debug, Clone, Copy)]
struct FastForward {
    initialized: bool,
    time: f64,
    p: Vector3<f64>,
    q: UnitQuaternion<f64>,
    v: Vector3<f64>,
    ba: Vector3<f64>,
    bg: Vector3<f64>,
    acc_0: Vector3<f64>,
    gyr_0: Vector3<f64>,
    gravity: Vector3<f64>,
}

impl FastForward {
    fn new() -> Self {
        Self {
            initialized: false,
            time: 0.0,
            p: Vector3::zeros(),
            q: UnitQuaternion::identity(),
            v: Vector3::zeros(),
            ba: Vector3::zeros(),
            bg: Vector3::zeros(),
            acc_0: Vector3::zeros(),
            gyr_0: Vector3::zeros(),
            gravity: Vector3::new(0.0, 0.0, -9.81),
        }
    }

    /// One midpoint step to timestamp t.
    fn predict(&mut self, t: f64, acc: Vector3<f64>, gyr: Vector3<f64>) {
        let dt = t - self.time;
        if dt <= 0.0 {
            return;
        }
        self.time = t;

        let un_acc_0 = self.q * (self.acc_0 - self.ba) + self.gravity;
        let un_gyr = 0.5 * (self.gyr_0 + gyr) - self.bg;
        self.q *= crate::geometry::delta_q(&(un_gyr * dt));
        let un_acc_1 = self.q * (acc - self.ba) + self.gravity;
        let un_acc = 0.5 * (un_acc_0 + un_acc_1);
        self.p += dt * self.v + 0.5 * dt * dt * un_acc;
        self.v += dt * un_acc;
        self.acc_0 = acc;
        self.gyr_0 = gyr;
    }
}

/// Queues guarded by the buffer mutex.
struct Buffers {
    feature: VecDeque<(f64, FeatureFrame)>,
    acc: VecDeque<(f64, Vector3<f64>)>,
    gyr: VecDeque<(f64, Vector3<f64>)>,
    images: VecDeque<(f64, Mat, Mat)>,
    latest: FastForward,
}

struct Shared {
    config: Arc<Config>,
    buf: Mutex<Buffers>,
    odometry_buf: Mutex<VecDeque<(f64, Matrix3<f64>, Vector3<f64>)>>,
    shutdown: AtomicBool,
    outputs: OutputSenders,
    tracker: Mutex<Box<dyn FeatureTracker>>,
}

/// Public pipeline handle: push samples in, receive estimates on the bus.
pub struct Pipeline {
    shared: Arc<Shared>,
    input_image_count: AtomicUsize,
    process_handle: Option<JoinHandle<()>>,
    depth_handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn the process (and optionally depth) threads. Fails fast on an
    /// inconsistent configuration.
    pub fn new(
        config: Arc<Config>,
        tracker: Box<dyn FeatureTracker>,
        depth: Option<DepthEstimator>,
    ) -> Result<(Self, OutputBus)> {
        config.validate()?;

        let (senders, bus) = output_channels();
        let shared = Arc::new(Shared {
            config: config.clone(),
            buf: Mutex::new(Buffers {
                feature: VecDeque::new(),
                acc: VecDeque::new(),
                gyr: VecDeque::new(),
                images: VecDeque::new(),
                latest: FastForward {
                    gravity: config.gravity(),
                    ..FastForward::new()
                },
            }),
            odometry_buf: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
            outputs: senders,
            tracker: Mutex::new(tracker),
        });

        let estimator = Estimator::new(config.clone());
        let process_handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("vio-process".into())
                .spawn(move || process_loop(shared, estimator))?
        };

        let depth_handle = match depth {
            Some(depth) => {
                let shared = shared.clone();
                Some(
                    thread::Builder::new()
                        .name("vio-depth".into())
                        .spawn(move || depth_loop(shared, depth))?,
                )
            }
            None => None,
        };

        Ok((
            Self {
                shared,
                input_image_count: AtomicUsize::new(0),
                process_handle,
                depth_handle,
            },
            bus,
        ))
    }

    /// Nonblocking IMU input: enqueue and, once the window has produced a
    /// state, fast-forward and publish high-rate odometry.
    pub fn input_imu(&self, t: f64, acc: Vector3<f64>, gyr: Vector3<f64>) {
        let config = &self.shared.config;
        let mut buf = self.shared.buf.lock();
        buf.acc.push_back((t, acc));
        buf.gyr.push_back((t, gyr));

        if buf.latest.initialized {
            let dt = t - buf.latest.time;
            if config.warn_imu_duration
                && (dt > 1.5 / config.imu_freq || dt < 0.5 / config.imu_freq)
            {
                warn!(
                    dt_ms = dt * 1e3,
                    "IMU sample duration not stable; check IMU and system load"
                );
            }
            buf.latest.predict(t, acc, gyr);
            let _ = self.shared.outputs.odometry.send(OdometryMsg {
                timestamp: t,
                position: buf.latest.p,
                orientation: buf.latest.q,
                velocity: buf.latest.v,
            });
        }
    }

    /// Nonblocking image input: run the tracker, enqueue the feature frame
    /// at half rate (and the raw pair for the depth thread).
    pub fn input_image(&self, t: f64, left: &Mat, right: Option<&Mat>) -> Result<()> {
        let frame = self.shared.tracker.lock().track_image(t, left, right)?;

        let count = self.input_image_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count % 2 == 0 {
            let mut buf = self.shared.buf.lock();
            buf.feature.push_back((t, frame));
            if self.shared.config.enable_depth {
                if let Some(right) = right {
                    buf.images.push_back((t, left.clone(), right.clone()));
                }
            }
        }
        Ok(())
    }

    /// Bypass the tracker and inject a feature frame directly (replay and
    /// tests).
    pub fn input_feature(&self, t: f64, frame: FeatureFrame) {
        self.shared.buf.lock().feature.push_back((t, frame));
    }

    /// Latest fast-forward pose, if the estimator has produced one.
    pub fn latest_odometry(&self) -> Option<OdometryMsg> {
        let buf = self.shared.buf.lock();
        buf.latest.initialized.then(|| OdometryMsg {
            timestamp: buf.latest.time,
            position: buf.latest.p,
            orientation: buf.latest.q,
            velocity: buf.latest.v,
        })
    }

    /// Stop every loop at its next sleep boundary and join the threads.
    /// Outstanding queue contents are discarded.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.process_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.depth_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Slice the IMU queues to the interval (t0, t1], including the first sample
/// at or past t1 as the interpolation endpoint. The sample at the boundary
/// stays queued for the next interval.
fn imu_interval(
    buf: &mut Buffers,
    t0: f64,
    t1: f64,
) -> (Vec<(f64, Vector3<f64>)>, Vec<(f64, Vector3<f64>)>) {
    let mut acc = Vec::new();
    let mut gyr = Vec::new();
    if buf.acc.is_empty() {
        return (acc, gyr);
    }

    while buf.acc.front().map_or(false, |(t, _)| *t <= t0) {
        buf.acc.pop_front();
        buf.gyr.pop_front();
    }
    while buf.acc.front().map_or(false, |(t, _)| *t < t1) {
        acc.push(buf.acc.pop_front().unwrap());
        gyr.push(buf.gyr.pop_front().unwrap());
    }
    if let (Some(&a), Some(&g)) = (buf.acc.front(), buf.gyr.front()) {
        acc.push(a);
        gyr.push(g);
    }
    (acc, gyr)
}

fn imu_available(buf: &Buffers, t: f64) -> bool {
    buf.acc.back().map_or(false, |(last, _)| t <= *last)
}

fn process_loop(shared: Arc<Shared>, mut estimator: Estimator) {
    let config = shared.config.clone();
    let mut prev_time = -1.0;

    info!("process thread started");
    while !shared.shutdown.load(Ordering::SeqCst) {
        let head = shared.buf.lock().feature.front().map(|(t, _)| *t);
        let Some(feature_time) = head else {
            thread::sleep(IDLE_SLEEP);
            continue;
        };

        let cur_time = feature_time + estimator.td;
        loop {
            if !config.use_imu || imu_available(&shared.buf.lock(), cur_time) {
                break;
            }
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            debug!(td = estimator.td, "waiting for IMU");
            thread::sleep(WAIT_SLEEP);
        }

        let (feature, acc_vec, gyr_vec) = {
            let mut buf = shared.buf.lock();
            let (acc_vec, gyr_vec) = if config.use_imu {
                imu_interval(&mut buf, prev_time, cur_time)
            } else {
                (Vec::new(), Vec::new())
            };
            if config.use_imu && prev_time > 0.0 {
                let span = cur_time - prev_time;
                let rate = acc_vec.len() as f64 / span;
                if span > 0.11 || rate < 350.0 {
                    warn!(span_ms = span * 1e3, rate, "long keyframe gap or low IMU rate");
                }
            }
            let feature = buf.feature.pop_front().unwrap();
            (feature, acc_vec, gyr_vec)
        };

        if config.use_imu {
            if !estimator.first_pose_initialized() {
                estimator.init_first_imu_pose(&acc_vec);
            }
            for i in 0..acc_vec.len() {
                let dt = if i == 0 {
                    acc_vec[i].0 - prev_time
                } else if i == acc_vec.len() - 1 {
                    cur_time - acc_vec[i - 1].0
                } else {
                    acc_vec[i].0 - acc_vec[i - 1].0
                };
                estimator.process_imu(dt, acc_vec[i].1, gyr_vec[i].1);
            }
        }

        estimator.process_image(&feature.1, feature.0);
        prev_time = cur_time;

        publish(&shared, &estimator, feature.0);

        // Feed the tracker prediction hints for the next frame.
        shared
            .tracker
            .lock()
            .set_prediction(&estimator.predict_pts_in_next_frame());

        if estimator.initialized() {
            update_latest(&shared, &estimator);
        }
    }
    info!("process thread exiting");
}

fn publish(shared: &Shared, estimator: &Estimator, header: f64) {
    if !estimator.initialized() {
        return;
    }
    let w = shared.config.window_size;
    let pose = SE3::from_parts(&estimator.rs[w], &estimator.ps[w]);

    let _ = shared.outputs.tf.send(TfMsg {
        timestamp: header,
        pose,
    });
    let _ = shared.outputs.bias.send(BiasMsg {
        timestamp: header,
        accel_bias: estimator.bas[w],
        gyro_bias: estimator.bgs[w],
    });
    let _ = shared.outputs.camera_pose.send(CameraPoseMsg {
        timestamp: header,
        poses: estimator
            .tic
            .iter()
            .zip(&estimator.ric)
            .map(|(t, r)| SE3::from_parts(r, t))
            .collect(),
    });
    let _ = shared.outputs.point_cloud.send(PointCloudMsg {
        timestamp: header,
        points: estimator.point_cloud(),
    });

    // Keyframes only on the MARG_OLD path.
    if estimator.marginalization_flag == MarginalizationFlag::MargOld {
        let _ = shared.outputs.keyframe.send(KeyframeMsg {
            timestamp: header,
            pose,
            points: estimator.point_cloud(),
        });
    }

    let mut odom = shared.odometry_buf.lock();
    odom.push_back((header, estimator.rs[w], estimator.ps[w]));
}

/// Refresh the fast-forward state from the window tail and replay every
/// buffered IMU sample past it.
fn update_latest(shared: &Shared, estimator: &Estimator) {
    let tail = estimator.tail_state();
    let mut buf = shared.buf.lock();

    buf.latest = FastForward {
        initialized: true,
        time: tail.time,
        p: tail.p,
        q: tail.q,
        v: tail.v,
        ba: tail.ba,
        bg: tail.bg,
        acc_0: tail.acc_0,
        gyr_0: tail.gyr_0,
        gravity: tail.gravity,
    };

    if let Some((last_t, _)) = buf.acc.back() {
        let backlog = last_t - tail.time;
        if backlog > 3.0 / shared.config.image_freq {
            warn!(backlog_ms = backlog * 1e3, "fast-forward backlog too high");
        }
    }

    let samples: Vec<(f64, Vector3<f64>, Vector3<f64>)> = buf
        .acc
        .iter()
        .zip(buf.gyr.iter())
        .map(|((t, a), (_, g))| (*t, *a, *g))
        .collect();
    for (t, acc, gyr) in samples {
        if t > buf.latest.time {
            let dt = t - buf.latest.time;
            if shared.config.warn_imu_duration && dt > 1.5 / shared.config.imu_freq {
                warn!(dt_ms = dt * 1e3, "IMU gap during fast-forward replay");
            }
            buf.latest.predict(t, acc, gyr);
        }
    }
}

fn depth_loop(shared: Arc<Shared>, mut depth: DepthEstimator) {
    info!("depth thread started");
    while !shared.shutdown.load(Ordering::SeqCst) {
        let pair = shared.buf.lock().images.pop_front();
        let Some((t, left, right)) = pair else {
            thread::sleep(WAIT_SLEEP);
            continue;
        };

        // Find the odometry stamped with this frame, discarding stale
        // entries; skip the frame if pairing fails.
        let pose = loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let mut odom = shared.odometry_buf.lock();
            while odom
                .front()
                .map_or(false, |(ot, _, _)| *ot < t - DEPTH_PAIR_TOL)
            {
                odom.pop_front();
            }
            match odom.front() {
                Some((ot, r, p)) if (ot - t).abs() <= DEPTH_PAIR_TOL => {
                    let pose = (*r, *p);
                    odom.pop_front();
                    break Some(pose);
                }
                Some((ot, _, _)) if *ot > t + DEPTH_PAIR_TOL => {
                    warn!(frame = t, odom = ot, "no matching odometry for depth frame");
                    break None;
                }
                _ => {}
            }
            drop(odom);
            thread::sleep(WAIT_SLEEP);
        };
        let Some((r_body, p_body)) = pose else {
            continue;
        };

        // Left-camera pose in the world.
        let r_wc = r_body * shared.config.ric[0];
        let t_wc = p_body + r_body * shared.config.tic[0];
        match depth.world_points(&left, &right, &r_wc, &t_wc) {
            Ok(points) => {
                let _ = shared.outputs.depth_cloud.send(PointCloudMsg {
                    timestamp: t,
                    points,
                });
            }
            Err(e) => warn!(error = %e, "depth generation failed"),
        }
    }
    info!("depth thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::feature::FeatureId;

    struct NullTracker;

    impl FeatureTracker for NullTracker {
        fn track_image(
            &mut self,
            _t: f64,
            _left: &Mat,
            _right: Option<&Mat>,
        ) -> Result<FeatureFrame> {
            Ok(FeatureFrame::new())
        }

        fn set_prediction(&mut self, _predictions: &HashMap<FeatureId, Vector3<f64>>) {}

        fn read_intrinsic_parameter(&mut self, _calib_files: &[String]) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            imu_freq: 200.0,
            ..Config::default()
        })
    }

    /// Static IMU with no images: initialization never fires, the
    /// fast-forward stays disabled, and no odometry is published.
    #[test]
    fn test_static_imu_without_images_stays_quiet() {
        let (mut pipeline, bus) =
            Pipeline::new(test_config(), Box::new(NullTracker), None).unwrap();

        let acc = Vector3::new(0.0, 0.0, 9.81);
        for i in 0..400 {
            pipeline.input_imu(i as f64 * 0.005, acc, Vector3::zeros());
        }
        thread::sleep(Duration::from_millis(50));

        assert!(pipeline.latest_odometry().is_none());
        assert!(bus.odometry.try_recv().is_err());
        pipeline.shutdown();
    }

    /// IMU slicing: a frame at 0.503 with td = 0.002 consumes samples
    /// through 0.505 and the endpoint-dt rule lands exactly on 0.505.
    #[test]
    fn test_imu_interval_alignment() {
        let mut buf = Buffers {
            feature: VecDeque::new(),
            acc: VecDeque::new(),
            gyr: VecDeque::new(),
            images: VecDeque::new(),
            latest: FastForward::new(),
        };
        for i in 0..=200 {
            let t = i as f64 * 0.005;
            buf.acc.push_back((t, Vector3::zeros()));
            buf.gyr.push_back((t, Vector3::zeros()));
        }

        let t0 = 0.4;
        let t1 = 0.503 + 0.002;
        let (acc, _) = imu_interval(&mut buf, t0, t1);

        // Strictly-after start, one endpoint sample at or past t1.
        assert!(acc.first().unwrap().0 > t0);
        assert_eq!(acc.last().unwrap().0, 0.505);

        // The endpoint-dt rule integrates exactly to t1.
        let mut covered = t0;
        for i in 0..acc.len() {
            let dt = if i == 0 {
                acc[i].0 - t0
            } else if i == acc.len() - 1 {
                t1 - acc[i - 1].0
            } else {
                acc[i].0 - acc[i - 1].0
            };
            covered += dt;
        }
        approx::assert_relative_eq!(covered, t1, epsilon = 1e-12);

        // The boundary sample stays queued for the next interval.
        assert_eq!(buf.acc.front().unwrap().0, 0.505);
    }

    #[test]
    fn test_fast_forward_static_prediction_stays_put() {
        let mut ff = FastForward::new();
        ff.initialized = true;
        ff.time = 0.0;
        ff.acc_0 = Vector3::new(0.0, 0.0, 9.81);

        for i in 1..=100 {
            ff.predict(i as f64 * 0.005, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros());
        }
        assert!(ff.p.norm() < 1e-9);
        assert!(ff.v.norm() < 1e-9);
    }

    /// Shutdown must stop the loops even with queued input.
    #[test]
    fn test_shutdown_exits_promptly() {
        let (mut pipeline, _bus) =
            Pipeline::new(test_config(), Box::new(NullTracker), None).unwrap();
        pipeline.input_feature(0.1, FeatureFrame::new());
        pipeline.shutdown();
        assert!(pipeline.process_handle.is_none());
    }
}
