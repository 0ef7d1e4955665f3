use nalgebra::Vector3;

use super::types::Matrix18;

/// Single IMU measurement.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub timestamp_s: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

/// IMU biases.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImuBias {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            accel: Vector3::zeros(),
            gyro: Vector3::zeros(),
        }
    }
}

/// IMU noise densities (1-sigma).
///
/// Defaults are the values used with consumer MEMS IMUs at a few hundred Hz;
/// real deployments should set them from the sensor datasheet.
#[derive(Debug, Clone, Copy)]
pub struct ImuNoise {
    /// Accelerometer measurement noise (m/s²/√Hz).
    pub acc_n: f64,
    /// Gyroscope measurement noise (rad/s/√Hz).
    pub gyr_n: f64,
    /// Accelerometer bias random walk (m/s³/√Hz).
    pub acc_w: f64,
    /// Gyroscope bias random walk (rad/s²/√Hz).
    pub gyr_w: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            acc_n: 0.1,
            gyr_n: 0.01,
            acc_w: 1e-3,
            gyr_w: 1e-4,
        }
    }
}

impl ImuNoise {
    /// 18×18 continuous-noise covariance for the midpoint propagation:
    /// diag(σ_a², σ_g², σ_a², σ_g², σ_ba², σ_bg²) with 3×3 blocks.
    pub fn input_covariance(&self) -> Matrix18 {
        let mut q = Matrix18::zeros();
        let blocks = [
            self.acc_n * self.acc_n,
            self.gyr_n * self.gyr_n,
            self.acc_n * self.acc_n,
            self.gyr_n * self.gyr_n,
            self.acc_w * self.acc_w,
            self.gyr_w * self.gyr_w,
        ];
        for (i, s) in blocks.iter().enumerate() {
            for j in 0..3 {
                q[(i * 3 + j, i * 3 + j)] = *s;
            }
        }
        q
    }
}
