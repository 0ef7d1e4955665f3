//! Camera model contract consumed by the tracker and the estimator.
//!
//! The estimator only ever needs two directions through the optics: lifting a
//! pixel to a projective ray and projecting a camera-frame point back to a
//! pixel. Concrete distortion models live behind this trait so the core never
//! sees the variant.

use nalgebra::{Vector2, Vector3};

/// Projection/unprojection interface for a single camera.
pub trait CameraModel: Send + Sync {
    /// Lift a pixel to a projective ray in the camera frame (z ≈ 1 for
    /// pinhole models; unit-norm for fisheye models).
    fn lift(&self, pixel: &Vector2<f64>) -> Vector3<f64>;

    /// Project a camera-frame point to a pixel.
    fn project(&self, point: &Vector3<f64>) -> Vector2<f64>;

    /// (width, height) in pixels.
    fn image_size(&self) -> (u32, u32);
}

/// Ideal pinhole camera (distortion already removed upstream).
#[derive(Debug, Clone, Copy)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl PinholeCamera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }
}

impl CameraModel for PinholeCamera {
    fn lift(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        )
    }

    fn project(&self, point: &Vector3<f64>) -> Vector2<f64> {
        Vector2::new(
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        )
    }

    fn image_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pinhole_lift_project_round_trip() {
        let cam = PinholeCamera::new(460.0, 460.0, 376.0, 240.0, 752, 480);
        let px = Vector2::new(100.0, 350.0);

        let ray = cam.lift(&px);
        assert_relative_eq!(ray.z, 1.0);
        assert_relative_eq!(cam.project(&ray), px, epsilon = 1e-12);

        // Scaling the ray must not move the projection.
        assert_relative_eq!(cam.project(&(ray * 7.5)), px, epsilon = 1e-9);
    }
}
