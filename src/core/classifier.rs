//! Local binary pattern histogram (LBPH) face classifier.
//!
//! Every sample is turned into a circular LBP code image, split into a
//! `grid_x` by `grid_y` grid, and described by the concatenated per-cell code
//! histograms. Prediction is nearest neighbour over all training histograms
//! under the chi-square distance, so lower distances are better matches.

use crate::common::{FaceGateError, Result};
use crate::core::normalizer::Sample;
use crate::storage::{write_atomic, IdentityId};
use image::GrayImage;
use ndarray::{s, Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

const MODEL_VERSION: u32 = 1;
const MAX_NEIGHBORS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    pub fn validate(&self) -> Result<()> {
        if self.radius == 0 {
            return Err(FaceGateError::Config("LBPH radius must be at least 1".into()));
        }
        if self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(FaceGateError::Config(format!(
                "LBPH neighbors must be between 1 and {}, got {}",
                MAX_NEIGHBORS, self.neighbors
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(FaceGateError::Config("LBPH grid must be at least 1x1".into()));
        }
        Ok(())
    }

    fn bins(&self) -> usize {
        1 << self.neighbors
    }

    fn histogram_len(&self) -> usize {
        (self.grid_x * self.grid_y) as usize * self.bins()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub identity_id: IdentityId,
    /// Chi-square distance to the closest training sample; 0 is identical.
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LbphModel {
    params: LbphParams,
    sample_size: (u32, u32),
    labels: Vec<IdentityId>,
    /// One row per training sample, in training order.
    histograms: Array2<f32>,
}

#[derive(Serialize, Deserialize)]
struct ModelEnvelope {
    version: u32,
    sha256: Vec<u8>,
    body: Vec<u8>,
}

pub struct FaceClassifier {
    params: LbphParams,
    model: Option<LbphModel>,
}

impl FaceClassifier {
    pub fn new(params: LbphParams) -> Self {
        Self { params, model: None }
    }

    pub fn params(&self) -> LbphParams {
        self.params
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    pub fn sample_count(&self) -> usize {
        self.model.as_ref().map(|m| m.labels.len()).unwrap_or(0)
    }

    /// Whether the current model was trained with any sample of `id`.
    pub fn knows(&self, id: IdentityId) -> bool {
        self.model.as_ref().map(|m| m.labels.contains(&id)).unwrap_or(false)
    }

    /// Rebuilds the model from scratch over `corpus`.
    ///
    /// On any error, including an empty corpus, the previous model stays in place.
    pub fn train(&mut self, corpus: &[(Sample, IdentityId)]) -> Result<()> {
        let first = corpus.first().ok_or(FaceGateError::EmptyCorpus)?;
        self.params.validate()?;
        let sample_size = first.0.dimensions();

        let mut histograms = Array2::<f32>::zeros((corpus.len(), self.params.histogram_len()));
        let mut labels = Vec::with_capacity(corpus.len());

        for (row, (sample, id)) in corpus.iter().enumerate() {
            if sample.dimensions() != sample_size {
                return Err(FaceGateError::InvalidSample(format!(
                    "Training sample {} is {:?}, expected {:?}",
                    row,
                    sample.dimensions(),
                    sample_size
                )));
            }
            let hist = spatial_histogram(sample.image(), &self.params)?;
            histograms.row_mut(row).assign(&hist);
            labels.push(*id);
        }

        tracing::info!(
            "Trained LBPH model on {} samples ({}x{} grid, {} neighbors)",
            labels.len(),
            self.params.grid_x,
            self.params.grid_y,
            self.params.neighbors
        );

        self.model = Some(LbphModel {
            params: self.params,
            sample_size,
            labels,
            histograms,
        });
        Ok(())
    }

    pub fn predict(&self, sample: &Sample) -> Result<Prediction> {
        let model = self.model.as_ref().ok_or(FaceGateError::NotTrained)?;
        if sample.dimensions() != model.sample_size {
            return Err(FaceGateError::InvalidSample(format!(
                "Probe is {:?}, model expects {:?}",
                sample.dimensions(),
                model.sample_size
            )));
        }

        let probe = spatial_histogram(sample.image(), &model.params)?;

        let mut best: Option<Prediction> = None;
        for (row, &label) in model.histograms.rows().into_iter().zip(&model.labels) {
            let distance = chi_square(row, probe.view());
            // Strict comparison keeps the first-seen sample on ties.
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction { identity_id: label, distance });
            }
        }

        best.ok_or(FaceGateError::NotTrained)
    }

    /// Atomically replaces the model file at `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let model = self.model.as_ref().ok_or(FaceGateError::NotTrained)?;
        let body = bincode::serialize(model)
            .map_err(|e| FaceGateError::Persistence(format!("Failed to serialize model: {}", e)))?;
        let envelope = ModelEnvelope {
            version: MODEL_VERSION,
            sha256: Sha256::digest(&body).to_vec(),
            body,
        };
        let bytes = bincode::serialize(&envelope)
            .map_err(|e| FaceGateError::Persistence(format!("Failed to serialize model: {}", e)))?;

        write_atomic(path, &bytes)?;
        tracing::info!("Saved model with {} samples to {}", model.labels.len(), path.display());
        Ok(())
    }

    /// Loads the model at `path`, returning whether one was found.
    ///
    /// A missing file leaves the classifier untrained. A corrupt one is an
    /// error and keeps whatever model was loaded before.
    pub fn load(&mut self, path: &Path) -> Result<bool> {
        if !path.exists() {
            tracing::info!("No model at {}, classifier is untrained", path.display());
            self.model = None;
            return Ok(false);
        }

        let bytes = fs::read(path).map_err(|e| {
            FaceGateError::Persistence(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let model = decode_model(&bytes)
            .map_err(|reason| FaceGateError::Persistence(format!("{}: {}", path.display(), reason)))?;

        if model.params != self.params {
            tracing::warn!(
                "Model at {} was trained with {:?}, configured {:?}; predictions use the model's",
                path.display(),
                model.params,
                self.params
            );
        }

        tracing::info!("Loaded model with {} samples from {}", model.labels.len(), path.display());
        self.model = Some(model);
        Ok(true)
    }
}

fn decode_model(bytes: &[u8]) -> std::result::Result<LbphModel, String> {
    let envelope: ModelEnvelope =
        bincode::deserialize(bytes).map_err(|e| format!("unreadable model file: {}", e))?;
    if envelope.version != MODEL_VERSION {
        return Err(format!("unsupported model version {}", envelope.version));
    }
    if Sha256::digest(&envelope.body).as_slice() != envelope.sha256.as_slice() {
        return Err("model checksum mismatch".into());
    }

    let model: LbphModel =
        bincode::deserialize(&envelope.body).map_err(|e| format!("corrupt model body: {}", e))?;
    if model.labels.len() != model.histograms.nrows()
        || model.histograms.ncols() != model.params.histogram_len()
    {
        return Err("model dimensions are inconsistent".into());
    }
    Ok(model)
}

/// Circular LBP codes with bilinear interpolation of the sampling points.
///
/// The output drops a `radius` wide border on every side.
fn lbp_codes(image: &GrayImage, params: &LbphParams) -> Array2<u32> {
    let (width, height) = image.dimensions();
    let r = params.radius as i64;
    let rows = (height as i64 - 2 * r).max(0) as usize;
    let cols = (width as i64 - 2 * r).max(0) as usize;
    let mut codes = Array2::<u32>::zeros((rows, cols));

    let px = |x: i64, y: i64| image.get_pixel(x as u32, y as u32)[0] as f64;

    for n in 0..params.neighbors {
        let angle = 2.0 * PI * n as f64 / params.neighbors as f64;
        let x = -(r as f64) * angle.sin();
        let y = r as f64 * angle.cos();

        let (fx, fy) = (x.floor() as i64, y.floor() as i64);
        let (cx, cy) = (x.ceil() as i64, y.ceil() as i64);
        let (tx, ty) = (x - fx as f64, y - fy as f64);
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for row in 0..rows {
            let i = row as i64 + r;
            for col in 0..cols {
                let j = col as i64 + r;
                let t = w1 * px(j + fx, i + fy)
                    + w2 * px(j + cx, i + fy)
                    + w3 * px(j + fx, i + cy)
                    + w4 * px(j + cx, i + cy);
                let centre = px(j, i);
                if t > centre || (t - centre).abs() < f32::EPSILON as f64 {
                    codes[[row, col]] |= 1 << n;
                }
            }
        }
    }

    codes
}

/// Concatenated per-cell code histograms, each cell normalised to unit mass.
fn spatial_histogram(image: &GrayImage, params: &LbphParams) -> Result<Array1<f32>> {
    let codes = lbp_codes(image, params);
    let (rows, cols) = codes.dim();
    let (grid_x, grid_y) = (params.grid_x as usize, params.grid_y as usize);
    if cols < grid_x || rows < grid_y {
        return Err(FaceGateError::InvalidSample(format!(
            "{}x{} sample is too small for radius {} and a {}x{} grid",
            image.width(),
            image.height(),
            params.radius,
            grid_x,
            grid_y
        )));
    }

    let bins = params.bins();
    let cell_w = cols / grid_x;
    let cell_h = rows / grid_y;
    let mut hist = Array1::<f32>::zeros(params.histogram_len());

    let mut offset = 0;
    for gy in 0..grid_y {
        for gx in 0..grid_x {
            let cell = codes.slice(s![gy * cell_h..(gy + 1) * cell_h, gx * cell_w..(gx + 1) * cell_w]);
            let weight = 1.0 / cell.len() as f32;
            for &code in cell.iter() {
                hist[offset + code as usize] += weight;
            }
            offset += bins;
        }
    }

    Ok(hist)
}

/// Alternative chi-square distance, symmetric in its arguments.
fn chi_square(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let sum = (x + y) as f64;
            if sum > f64::EPSILON {
                let diff = (x - y) as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}
