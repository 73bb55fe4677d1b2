// Pest and disease classification over an ONNX image model

use anyhow::{Context, Result};
use image::DynamicImage;
use ndarray::Array4;
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use parking_lot::Mutex;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::core::config::ModelConfig;
use crate::core::errors::{ClassifierError, ClassifierResult};
use crate::core::types::Classification;

/// Image classifier. Synchronous and CPU-bound; callers run it on the
/// blocking pool.
pub trait Classifier: Send + Sync {
    fn classify(&self, image: &DynamicImage) -> ClassifierResult<Classification>;

    /// Number of known class labels
    fn labels_count(&self) -> usize;
}

pub struct OnnxClassifier {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    labels: Vec<String>,
    image_size: u32,
}

impl OnnxClassifier {
    /// Load the model and its labels. A missing model file is an error; a
    /// missing labels file only degrades labels to `class_<index>`.
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let model_path = Path::new(&config.model_path);
        if !model_path.exists() {
            anyhow::bail!("Model file not found: {}", model_path.display());
        }

        let start = Instant::now();
        let session = Session::builder()?
            .with_execution_providers([CPUExecutionProvider::default().build()])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load model {}", model_path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("Model declares no inputs")?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .context("Model declares no outputs")?;

        let labels = load_labels(Path::new(&config.labels_path))?;

        info!(
            "✓ Classifier loaded in {:.2}s: {} labels, {} threads",
            start.elapsed().as_secs_f64(),
            labels.len(),
            config.intra_threads
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            labels,
            image_size: config.image_size,
        })
    }

    /// NHWC float tensor, RGB scaled to [0, 1]
    fn preprocess_image(&self, img: &DynamicImage) -> Array4<f32> {
        let size = self.image_size;
        trace!("Preprocessing image: {}x{} → {}x{}", img.width(), img.height(), size, size);

        let rgb_img = img
            .resize_exact(size, size, image::imageops::FilterType::Triangle)
            .to_rgb8();

        let target = size as usize;
        let mut array = Array4::<f32>::zeros((1, target, target, 3));
        for (x, y, pixel) in rgb_img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, y, x, 0]] = pixel[0] as f32 / 255.0;
            array[[0, y, x, 1]] = pixel[1] as f32 / 255.0;
            array[[0, y, x, 2]] = pixel[2] as f32 / 255.0;
        }
        array
    }
}

impl Classifier for OnnxClassifier {
    fn classify(&self, image: &DynamicImage) -> ClassifierResult<Classification> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ClassifierError::InvalidInput("image has no pixels".to_string()));
        }

        let input = Value::from_array(self.preprocess_image(image))?;

        let inference_start = Instant::now();
        let scores = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![self.input_name.as_str() => input])?;
            let (_shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
            data.to_vec()
        };
        debug!(
            "Inference completed in {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );

        let (index, confidence) = top_class(&scores).ok_or(ClassifierError::EmptyOutput)?;
        Ok(Classification {
            label: label_for(&self.labels, index),
            confidence,
            index,
        })
    }

    fn labels_count(&self) -> usize {
        self.labels.len()
    }
}

/// One label per line, blank lines skipped
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        warn!("Labels file {} not found, using class indices", path.display());
        return Ok(Vec::new());
    }

    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read labels {}", path.display()))?;
    Ok(parse_labels(&data))
}

fn parse_labels(data: &str) -> Vec<String> {
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn label_for(labels: &[String], index: usize) -> String {
    labels
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("class_{}", index))
}

/// Arg-max over the model output. Raw logits are passed through softmax so
/// the confidence is a probability either way.
fn top_class(scores: &[f32]) -> Option<(usize, f32)> {
    let (index, _) = scores
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))?;

    let probabilities = if is_distribution(scores) {
        scores.to_vec()
    } else {
        softmax(scores)
    };

    Some((index, probabilities[index].clamp(0.0, 1.0)))
}

fn is_distribution(scores: &[f32]) -> bool {
    let sum: f32 = scores.iter().sum();
    scores.iter().all(|s| (0.0..=1.0).contains(s)) && (sum - 1.0).abs() < 1e-3
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores
        .iter()
        .map(|s| if s.is_finite() { (s - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}
