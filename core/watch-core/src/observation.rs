//! Observation sources: frame in, (count, confidence) out.
//!
//! The detector itself runs outside this process. What arrives here is its
//! list of boxes; [`DetectionCounter`] keeps the boxes of the tracked class
//! that clear the confidence threshold.

use stagewatch_daemon_protocol::FramePayload;

use crate::error::ObservationError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub count: u32,
    /// Mean confidence of the counted detections, 0.0 when none were counted.
    pub confidence: f32,
}

pub trait ObservationSource {
    fn observe(&self, frame: &FramePayload) -> Result<Observation, ObservationError>;
}

#[derive(Debug, Clone)]
pub struct DetectionCounter {
    tracked_class: String,
    conf_threshold: f32,
}

impl DetectionCounter {
    pub fn new(tracked_class: impl Into<String>, conf_threshold: f32) -> Self {
        Self {
            tracked_class: tracked_class.into(),
            conf_threshold,
        }
    }

    pub fn tracked_class(&self) -> &str {
        &self.tracked_class
    }
}

impl ObservationSource for DetectionCounter {
    fn observe(&self, frame: &FramePayload) -> Result<Observation, ObservationError> {
        let mut count = 0u32;
        let mut total = 0.0f32;

        for (index, detection) in frame.detections.iter().enumerate() {
            if !detection.confidence.is_finite() || !(0.0..=1.0).contains(&detection.confidence)
            {
                return Err(ObservationError::InvalidConfidence {
                    index,
                    confidence: detection.confidence,
                });
            }
            if detection.label.trim().is_empty() {
                return Err(ObservationError::EmptyLabel { index });
            }
            if detection.label != self.tracked_class || detection.confidence < self.conf_threshold
            {
                continue;
            }
            count += 1;
            total += detection.confidence;
        }

        let confidence = if count > 0 { total / count as f32 } else { 0.0 };
        Ok(Observation { count, confidence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagewatch_daemon_protocol::Detection;

    fn frame(detections: &[(&str, f32)]) -> FramePayload {
        FramePayload {
            timestamp_ms: None,
            detections: detections
                .iter()
                .map(|(label, confidence)| Detection {
                    label: label.to_string(),
                    confidence: *confidence,
                    bbox: None,
                })
                .collect(),
        }
    }

    #[test]
    fn counts_tracked_class_above_threshold() {
        let counter = DetectionCounter::new("cup", 0.2);
        let observation = counter
            .observe(&frame(&[
                ("cup", 0.9),
                ("cup", 0.5),
                ("cup", 0.1),
                ("bottle", 0.95),
            ]))
            .expect("observation");
        assert_eq!(observation.count, 2);
        assert!((observation.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn empty_frame_counts_zero() {
        let counter = DetectionCounter::new("cup", 0.2);
        let observation = counter.observe(&frame(&[])).expect("observation");
        assert_eq!(
            observation,
            Observation {
                count: 0,
                confidence: 0.0
            }
        );
    }

    #[test]
    fn threshold_is_inclusive() {
        let counter = DetectionCounter::new("cup", 0.5);
        let observation = counter.observe(&frame(&[("cup", 0.5)])).expect("observation");
        assert_eq!(observation.count, 1);
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let counter = DetectionCounter::new("cup", 0.2);
        let err = counter
            .observe(&frame(&[("cup", 0.4), ("cup", 1.5)]))
            .unwrap_err();
        assert_eq!(
            err,
            ObservationError::InvalidConfidence {
                index: 1,
                confidence: 1.5
            }
        );
        assert!(counter.observe(&frame(&[("cup", f32::NAN)])).is_err());
    }

    #[test]
    fn rejects_empty_label() {
        let counter = DetectionCounter::new("cup", 0.2);
        let err = counter.observe(&frame(&[("  ", 0.4)])).unwrap_err();
        assert_eq!(err, ObservationError::EmptyLabel { index: 0 });
    }
}
