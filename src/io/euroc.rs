//! EuRoC-format dataset loading for offline replay.
//!
//! Reads the `cam0/cam1` image lists and the `imu0` sample list; images are
//! decoded grayscale on demand.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use nalgebra::Vector3;
use opencv::core::Mat;
use opencv::imgcodecs::{self, IMREAD_GRAYSCALE};
use serde::Deserialize;

use crate::imu::ImuSample;

/// One row of a `camN/data.csv` image list.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

/// One row of an `imu0/data.csv` sample list: gyro first, then accel,
/// matching the EuRoC column order.
#[derive(Debug, Clone, Copy, Deserialize)]
struct ImuRecord {
    timestamp_ns: u64,
    gyro_x: f64,
    gyro_y: f64,
    gyro_z: f64,
    accel_x: f64,
    accel_y: f64,
    accel_z: f64,
}

#[derive(Debug, Clone)]
pub struct StereoImagePair {
    pub timestamp_s: f64,
    pub left: Mat,
    pub right: Mat,
}

#[derive(Debug)]
pub struct EurocDataset {
    root: PathBuf,
    pub cam0_entries: Vec<ImageEntry>,
    pub cam1_entries: Vec<ImageEntry>,
    pub imu_entries: Vec<ImuSample>,
}

impl EurocDataset {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let cam0_entries = load_image_list(root.join("cam0/data.csv"))?;
        let cam1_entries = load_image_list(root.join("cam1/data.csv"))?;
        if cam0_entries.len() != cam1_entries.len() {
            bail!("cam0 and cam1 have a different number of frames");
        }
        let imu_entries = load_imu_list(root.join("imu0/data.csv"))?;

        Ok(Self {
            root,
            cam0_entries,
            cam1_entries,
            imu_entries,
        })
    }

    pub fn len(&self) -> usize {
        self.cam0_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cam0_entries.is_empty()
    }

    pub fn stereo_pair(&self, idx: usize) -> Result<StereoImagePair> {
        let left_entry = self
            .cam0_entries
            .get(idx)
            .with_context(|| format!("no left frame at index {idx}"))?;
        let right_entry = self
            .cam1_entries
            .get(idx)
            .with_context(|| format!("no right frame at index {idx}"))?;

        let left_path = self.root.join("cam0/data").join(&left_entry.filename);
        let right_path = self.root.join("cam1/data").join(&right_entry.filename);
        let left = imgcodecs::imread(
            left_path.to_str().context("non-utf8 path")?,
            IMREAD_GRAYSCALE,
        )?;
        let right = imgcodecs::imread(
            right_path.to_str().context("non-utf8 path")?,
            IMREAD_GRAYSCALE,
        )?;

        Ok(StereoImagePair {
            timestamp_s: left_entry.timestamp_ns as f64 * 1e-9,
            left,
            right,
        })
    }

    /// IMU samples with timestamps in [t0, t1), seconds.
    pub fn imu_between(&self, t0: f64, t1: f64) -> Vec<ImuSample> {
        self.imu_entries
            .iter()
            .filter(|s| s.timestamp_s >= t0 && s.timestamp_s < t1)
            .copied()
            .collect()
    }
}

fn load_image_list(path: PathBuf) -> Result<Vec<ImageEntry>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(&path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut entries = Vec::new();
    for record in reader.deserialize() {
        let entry: ImageEntry = record?;
        entries.push(entry);
    }
    Ok(entries)
}

fn load_imu_list(path: PathBuf) -> Result<Vec<ImuSample>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(&path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut entries = Vec::new();
    for record in reader.deserialize() {
        let row: ImuRecord = record?;
        entries.push(ImuSample {
            timestamp_s: row.timestamp_ns as f64 * 1e-9,
            accel: Vector3::new(row.accel_x, row.accel_y, row.accel_z),
            gyro: Vector3::new(row.gyro_x, row.gyro_y, row.gyro_z),
        });
    }
    Ok(entries)
}
