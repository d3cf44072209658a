//! Haar cascade face detection.
//!
//! The cascade is a boosted sequence of stages over weighted Haar rectangles,
//! loaded from OpenCV's XML cascade files or an equivalent JSON description.
//! A window is scanned across the frame at
//! growing scales and must pass every stage; surviving windows are grouped so
//! that only regions hit by enough overlapping windows are reported.

use crate::common::{FaceGateError, Result};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::integral_image::{integral_image, integral_squared_image};
use roxmltree::Node;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

/// Similarity tolerance used when grouping raw window hits.
const GROUP_EPS: f32 = 0.2;

type SumImage = ImageBuffer<Luma<u32>, Vec<u32>>;
type SqSumImage = ImageBuffer<Luma<u64>, Vec<u64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }
}

/// Locates face regions in a grayscale frame.
///
/// Implementations are stateless across calls and return boxes in their own
/// scan order; callers must not rely on any sorting.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &GrayImage) -> Vec<FaceBox>;
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    /// Window growth per pyramid level, must be > 1.0.
    pub scale_factor: f32,
    /// Raw hits a region needs beyond the first to be reported.
    pub min_neighbors: u32,
    /// Smallest window side scanned, in pixels.
    pub min_face_size: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.3,
            min_neighbors: 5,
            min_face_size: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaarCascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<CascadeStage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeStage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// A single-split decision stump over one Haar feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeakClassifier {
    pub rects: Vec<WeightedRect>,
    pub threshold: f32,
    pub left_val: f32,
    pub right_val: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

impl HaarCascade {
    pub fn from_json(json: &str) -> Result<Self> {
        let cascade: HaarCascade = serde_json::from_str(json)
            .map_err(|e| FaceGateError::Cascade(format!("Failed to parse cascade: {}", e)))?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Reads an OpenCV `opencv_storage` cascade such as
    /// `haarcascade_frontalface_default.xml`.
    ///
    /// Only upright Haar features on single-split trees are supported, which
    /// covers the stock frontal face cascades.
    pub fn from_opencv_xml(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| FaceGateError::Cascade(format!("Failed to parse cascade XML: {}", e)))?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| FaceGateError::Cascade("No <cascade> element in cascade XML".into()))?;

        if let Ok(kind) = xml_child(root, "featureType") {
            let kind = kind.text().unwrap_or("").trim();
            if !kind.eq_ignore_ascii_case("HAAR") {
                return Err(FaceGateError::Cascade(format!("Unsupported feature type {}", kind)));
            }
        }

        let window_width = xml_value(root, "width")?;
        let window_height = xml_value(root, "height")?;

        let features = xml_items(xml_child(root, "features")?)
            .map(xml_feature)
            .collect::<Result<Vec<_>>>()?;

        let stages = xml_items(xml_child(root, "stages")?)
            .enumerate()
            .map(|(s, stage)| -> Result<CascadeStage> {
                let classifiers = xml_items(xml_child(stage, "weakClassifiers")?)
                    .map(|weak| xml_stump(weak, &features, s))
                    .collect::<Result<Vec<_>>>()?;
                Ok(CascadeStage {
                    threshold: xml_value(stage, "stageThreshold")?,
                    classifiers,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let cascade = HaarCascade { window_width, window_height, stages };
        cascade.validate()?;
        Ok(cascade)
    }

    /// Loads `.xml` files as OpenCV cascades and anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FaceGateError::Cascade(format!(
                "Cascade not found at: {}", path.display()
            )));
        }
        let contents = std::fs::read_to_string(path)?;
        let is_xml = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("xml"));
        let cascade = if is_xml {
            Self::from_opencv_xml(&contents)?
        } else {
            Self::from_json(&contents)?
        };
        tracing::info!(
            "Loaded cascade {} ({}x{} window, {} stages)",
            path.display(), cascade.window_width, cascade.window_height, cascade.stages.len()
        );
        Ok(cascade)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_width == 0 || self.window_height == 0 {
            return Err(FaceGateError::Cascade("Cascade window must be non-empty".into()));
        }
        if self.stages.is_empty() {
            return Err(FaceGateError::Cascade("Cascade has no stages".into()));
        }
        for (s, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(FaceGateError::Cascade(format!("Stage {} has no classifiers", s)));
            }
            for classifier in &stage.classifiers {
                if classifier.rects.is_empty() {
                    return Err(FaceGateError::Cascade(format!(
                        "Stage {} has a classifier without rectangles", s
                    )));
                }
                for r in &classifier.rects {
                    if r.width == 0 || r.height == 0
                        || r.x + r.width > self.window_width
                        || r.y + r.height > self.window_height
                    {
                        return Err(FaceGateError::Cascade(format!(
                            "Stage {} rectangle {:?} falls outside the {}x{} window",
                            s, r, self.window_width, self.window_height
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn xml_child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name)).ok_or_else(|| {
        FaceGateError::Cascade(format!("Missing <{}> in <{}>", name, node.tag_name().name()))
    })
}

// List entries are `<_>` elements, interleaved with comments.
fn xml_items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn xml_value<T>(node: Node<'_, '_>, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = xml_child(node, name)?.text().unwrap_or("").trim().to_string();
    raw.parse()
        .map_err(|e| FaceGateError::Cascade(format!("Bad <{}> value {:?}: {}", name, raw, e)))
}

fn xml_numbers(node: Node<'_, '_>) -> Result<Vec<f32>> {
    node.text()
        .unwrap_or("")
        .split_whitespace()
        .map(|t| {
            t.parse::<f32>()
                .map_err(|e| FaceGateError::Cascade(format!("Bad number {:?} in cascade: {}", t, e)))
        })
        .collect()
}

fn xml_feature(feature: Node<'_, '_>) -> Result<Vec<WeightedRect>> {
    if let Ok(tilted) = xml_child(feature, "tilted") {
        if tilted.text().map(str::trim) == Some("1") {
            return Err(FaceGateError::Cascade("Tilted Haar features are not supported".into()));
        }
    }

    xml_items(xml_child(feature, "rects")?)
        .map(|rect| -> Result<WeightedRect> {
            let v = xml_numbers(rect)?;
            if v.len() != 5 || v[..4].iter().any(|n| *n < 0.0 || n.fract() != 0.0) {
                return Err(FaceGateError::Cascade(format!("Malformed feature rectangle {:?}", v)));
            }
            Ok(WeightedRect {
                x: v[0] as u32,
                y: v[1] as u32,
                width: v[2] as u32,
                height: v[3] as u32,
                weight: v[4],
            })
        })
        .collect()
}

// `internalNodes` is "left right feature threshold" for a single split.
fn xml_stump(weak: Node<'_, '_>, features: &[Vec<WeightedRect>], stage: usize) -> Result<WeakClassifier> {
    let nodes = xml_numbers(xml_child(weak, "internalNodes")?)?;
    let leaves = xml_numbers(xml_child(weak, "leafValues")?)?;
    if nodes.len() != 4 || leaves.len() != 2 {
        return Err(FaceGateError::Cascade(format!(
            "Stage {} uses trees deeper than one split", stage
        )));
    }

    let index = nodes[2];
    let rects = (if index >= 0.0 { features.get(index as usize) } else { None })
        .cloned()
        .ok_or_else(|| {
            FaceGateError::Cascade(format!("Stage {} refers to missing feature {}", stage, index))
        })?;

    Ok(WeakClassifier {
        rects,
        threshold: nodes[3],
        left_val: leaves[0],
        right_val: leaves[1],
    })
}

// Cascade rescaled to one window size, ready for evaluation.
struct ScaledStage {
    threshold: f64,
    classifiers: Vec<ScaledClassifier>,
}

struct ScaledClassifier {
    rects: Vec<(u32, u32, u32, u32, f64)>,
    threshold: f64,
    left_val: f64,
    right_val: f64,
}

pub struct HaarCascadeDetector {
    cascade: HaarCascade,
    params: DetectorParams,
}

impl HaarCascadeDetector {
    pub fn new(cascade: HaarCascade, params: DetectorParams) -> Self {
        Self { cascade, params }
    }

    pub fn load(path: &Path, params: DetectorParams) -> Result<Self> {
        Ok(Self::new(HaarCascade::load(path)?, params))
    }

    /// Every window that passes all stages, before grouping.
    pub fn detect_raw(&self, frame: &GrayImage) -> Vec<FaceBox> {
        let (img_w, img_h) = frame.dimensions();
        let (base_w, base_h) = (self.cascade.window_width, self.cascade.window_height);
        if img_w < base_w || img_h < base_h {
            return Vec::new();
        }

        let sum: SumImage = integral_image::<_, u32>(frame);
        let sqsum: SqSumImage = integral_squared_image::<_, u64>(frame);

        let mut hits = Vec::new();
        let mut scale = (self.params.min_face_size as f32 / base_w.min(base_h) as f32).max(1.0);

        loop {
            let win_w = (base_w as f32 * scale).round() as u32;
            let win_h = (base_h as f32 * scale).round() as u32;
            if win_w > img_w || win_h > img_h {
                break;
            }

            let stages = self.scaled_stages(scale, win_w, win_h);
            let step = if scale > 2.0 { scale } else { 2.0 * scale };
            let step = (step.round() as usize).max(1);

            for y in (0..=img_h - win_h).step_by(step) {
                for x in (0..=img_w - win_w).step_by(step) {
                    if evaluate_window(&stages, &sum, &sqsum, x, y, win_w, win_h) {
                        hits.push(FaceBox::new(x, y, win_w, win_h));
                    }
                }
            }

            scale *= self.params.scale_factor;
        }

        tracing::trace!("Cascade produced {} raw hits", hits.len());
        hits
    }

    fn scaled_stages(&self, scale: f32, win_w: u32, win_h: u32) -> Vec<ScaledStage> {
        self.cascade
            .stages
            .iter()
            .map(|stage| ScaledStage {
                threshold: stage.threshold as f64,
                classifiers: stage
                    .classifiers
                    .iter()
                    .map(|c| scale_classifier(c, scale, win_w, win_h))
                    .collect(),
            })
            .collect()
    }
}

impl FaceDetector for HaarCascadeDetector {
    fn detect(&self, frame: &GrayImage) -> Vec<FaceBox> {
        let raw = self.detect_raw(frame);
        group_rectangles(&raw, self.params.min_neighbors)
    }
}

fn scale_classifier(classifier: &WeakClassifier, scale: f32, win_w: u32, win_h: u32) -> ScaledClassifier {
    let mut rects: Vec<(u32, u32, u32, u32, f64)> = classifier
        .rects
        .iter()
        .map(|r| {
            let x = ((r.x as f32 * scale).round() as u32).min(win_w - 1);
            let y = ((r.y as f32 * scale).round() as u32).min(win_h - 1);
            let w = ((r.width as f32 * scale).round() as u32).clamp(1, win_w - x);
            let h = ((r.height as f32 * scale).round() as u32).clamp(1, win_h - y);
            (x, y, w, h, r.weight as f64)
        })
        .collect();

    // Rounding breaks the zero response on flat regions; rebalance the first
    // rectangle against the others so a uniform window still scores zero.
    if rects.len() > 1 {
        let area0 = (rects[0].2 * rects[0].3) as f64;
        let others: f64 = rects[1..].iter().map(|r| r.4 * (r.2 * r.3) as f64).sum();
        rects[0].4 = -others / area0;
    }

    ScaledClassifier {
        rects,
        threshold: classifier.threshold as f64,
        left_val: classifier.left_val as f64,
        right_val: classifier.right_val as f64,
    }
}

fn evaluate_window(
    stages: &[ScaledStage],
    sum: &SumImage,
    sqsum: &SqSumImage,
    x: u32,
    y: u32,
    win_w: u32,
    win_h: u32,
) -> bool {
    let inv_area = 1.0 / (win_w as f64 * win_h as f64);
    let mean = rect_sum(sum, x, y, win_w, win_h) as f64 * inv_area;
    let variance = rect_sq_sum(sqsum, x, y, win_w, win_h) as f64 * inv_area - mean * mean;
    let std_dev = if variance > 0.0 { variance.sqrt() } else { 1.0 };

    for stage in stages {
        let mut stage_sum = 0.0;
        for classifier in &stage.classifiers {
            let mut value = 0.0;
            for &(rx, ry, rw, rh, weight) in &classifier.rects {
                value += rect_sum(sum, x + rx, y + ry, rw, rh) as f64 * weight;
            }
            value *= inv_area;
            stage_sum += if value < classifier.threshold * std_dev {
                classifier.left_val
            } else {
                classifier.right_val
            };
        }
        if stage_sum < stage.threshold {
            return false;
        }
    }
    true
}

// Integral images carry an extra leading row and column of zeros.
fn rect_sum(sum: &SumImage, x: u32, y: u32, w: u32, h: u32) -> u64 {
    let a = sum.get_pixel(x, y)[0] as u64;
    let b = sum.get_pixel(x + w, y)[0] as u64;
    let c = sum.get_pixel(x, y + h)[0] as u64;
    let d = sum.get_pixel(x + w, y + h)[0] as u64;
    (d + a) - (b + c)
}

fn rect_sq_sum(sqsum: &SqSumImage, x: u32, y: u32, w: u32, h: u32) -> u64 {
    let a = sqsum.get_pixel(x, y)[0];
    let b = sqsum.get_pixel(x + w, y)[0];
    let c = sqsum.get_pixel(x, y + h)[0];
    let d = sqsum.get_pixel(x + w, y + h)[0];
    (d + a) - (b + c)
}

/// Clusters similar rectangles and keeps clusters with more than
/// `min_neighbors` members, each reported as the member average.
///
/// `min_neighbors == 0` disables grouping. Output follows the order in which
/// clusters were first seen.
pub fn group_rectangles(rects: &[FaceBox], min_neighbors: u32) -> Vec<FaceBox> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j]) {
                union(&mut parent, i, j);
            }
        }
    }

    let mut label_of_root: Vec<Option<usize>> = vec![None; n];
    let mut clusters: Vec<(u32, [f64; 4])> = Vec::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        let label = match label_of_root[root] {
            Some(label) => label,
            None => {
                clusters.push((0, [0.0; 4]));
                label_of_root[root] = Some(clusters.len() - 1);
                clusters.len() - 1
            }
        };
        let r = &rects[i];
        let entry = &mut clusters[label];
        entry.0 += 1;
        entry.1[0] += r.x as f64;
        entry.1[1] += r.y as f64;
        entry.1[2] += r.width as f64;
        entry.1[3] += r.height as f64;
    }

    let candidates: Vec<(FaceBox, u32)> = clusters
        .iter()
        .filter(|(count, _)| *count > min_neighbors)
        .map(|(count, sums)| {
            let s = 1.0 / *count as f64;
            let averaged = FaceBox::new(
                (sums[0] * s).round() as u32,
                (sums[1] * s).round() as u32,
                (sums[2] * s).round() as u32,
                (sums[3] * s).round() as u32,
            );
            (averaged, *count)
        })
        .collect();

    // Drop small groups nested inside a stronger neighbouring group.
    candidates
        .iter()
        .enumerate()
        .filter(|(i, (r1, n1))| {
            !candidates.iter().enumerate().any(|(j, (r2, n2))| {
                if *i == j {
                    return false;
                }
                let dx = (r2.width as f32 * GROUP_EPS).round() as i64;
                let dy = (r2.height as f32 * GROUP_EPS).round() as i64;
                let inside = r1.x as i64 >= r2.x as i64 - dx
                    && r1.y as i64 >= r2.y as i64 - dy
                    && r1.right() as i64 <= r2.right() as i64 + dx
                    && r1.bottom() as i64 <= r2.bottom() as i64 + dy;
                inside && (*n2 > (*n1).max(3) || *n1 < 3)
            })
        })
        .map(|(_, (r, _))| *r)
        .collect()
}

fn similar(a: &FaceBox, b: &FaceBox) -> bool {
    let delta = GROUP_EPS
        * (a.width.min(b.width) as f32 + a.height.min(b.height) as f32)
        * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        parent[rb] = ra;
    }
}
