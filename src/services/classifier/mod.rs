pub mod inference;
pub mod model_manager;

use crate::error::AppError;
use crate::models::classify_types::{Classification, Prediction};
use image::DynamicImage;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A vision-language model that scores one image against a set of text labels.
///
/// Implementations must be safe to call from many threads at once against the
/// same loaded weights.
pub trait ZeroShotModel: Send + Sync {
    /// Returns one similarity logit per label, in label order.
    fn score(&self, image: &DynamicImage, labels: &[&str]) -> Result<Vec<f32>, AppError>;
}

/// Locks shared model state, recovering it if an earlier caller panicked while
/// holding the lock. Inference state carries no invariant a panic can break.
pub fn exclusive<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let exp_sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / exp_sum).collect()
}

/// Index of the largest value. The first maximal index wins on ties.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in values.iter().enumerate() {
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

pub fn classify(
    model: &dyn ZeroShotModel,
    image: &DynamicImage,
    labels: &[&str],
) -> Result<Classification, AppError> {
    if labels.is_empty() {
        return Err("Cannot classify against an empty label set".into());
    }

    let logits = model.score(image, labels)?;
    if logits.len() != labels.len() {
        return Err(format!(
            "Model returned {} scores for {} labels",
            logits.len(),
            labels.len()
        )
        .into());
    }
    if logits.iter().any(|x| !x.is_finite()) {
        return Err("Model returned non-finite scores".into());
    }

    let probabilities = softmax(&logits);
    let index = argmax(&probabilities).ok_or("Model produced no scores")?;

    let distribution = labels
        .iter()
        .zip(&probabilities)
        .map(|(label, &confidence)| Prediction {
            class_name: label.to_string(),
            confidence,
        })
        .collect();

    Ok(Classification {
        index,
        confidence: probabilities[index],
        distribution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLogits(Vec<f32>);

    impl ZeroShotModel for FixedLogits {
        fn score(&self, _image: &DynamicImage, _labels: &[&str]) -> Result<Vec<f32>, AppError> {
            Ok(self.0.clone())
        }
    }

    fn blank() -> DynamicImage {
        DynamicImage::new_rgb8(4, 4)
    }

    #[test]
    fn exclusive_recovers_poisoned_lock() {
        let lock = std::sync::Arc::new(Mutex::new(7u32));
        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("inference blew up");
        })
        .join();

        assert!(lock.is_poisoned());
        let mut guard = exclusive(&lock);
        *guard += 1;
        assert_eq!(*guard, 8);
    }

    #[test]
    fn softmax_is_a_distribution() {
        let probs = softmax(&[12.0, 30.5, -4.0, 0.0, 29.9, 1e-3, 7.0]);
        let total: f32 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn softmax_handles_large_logits() {
        let probs = softmax(&[1000.0, 1000.0]);
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!((probs[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn argmax_prefers_first_on_tie() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]), Some(1));
        assert_eq!(argmax(&[0.25, 0.25, 0.25, 0.25]), Some(0));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn classify_reports_max_probability() {
        let model = FixedLogits(vec![1.0, 5.0, 2.0]);
        let result = classify(&model, &blank(), &["a", "b", "c"]).unwrap();

        assert_eq!(result.index, 1);
        assert_eq!(result.distribution[1].class_name, "b");
        let max = result
            .distribution
            .iter()
            .map(|p| p.confidence)
            .fold(f32::NEG_INFINITY, f32::max);
        assert_eq!(result.confidence, max);
        let total: f32 = result.distribution.iter().map(|p| p.confidence).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn classify_rejects_mismatched_output() {
        let model = FixedLogits(vec![1.0, 2.0]);
        let err = classify(&model, &blank(), &["a", "b", "c"]).unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[test]
    fn classify_rejects_nan_scores() {
        let model = FixedLogits(vec![1.0, f32::NAN]);
        assert!(classify(&model, &blank(), &["a", "b"]).is_err());
    }
}
