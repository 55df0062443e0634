use crate::types::BoundingBox;
use std::cmp::Ordering;

const DEFAULT_OVERLAP_THRESHOLD: f32 = 0.3;

/// Suppresses duplicate boxes the detector emits for a single face.
#[derive(Debug, Clone, Copy)]
pub struct DetectionMerger {
    overlap_threshold: f32,
}

impl Default for DetectionMerger {
    fn default() -> Self {
        Self::new(DEFAULT_OVERLAP_THRESHOLD)
    }
}

impl DetectionMerger {
    pub fn new(overlap_threshold: f32) -> Self {
        Self { overlap_threshold }
    }

    pub fn overlap_threshold(&self) -> f32 {
        self.overlap_threshold
    }

    /// Greedy NMS: keep the best-scoring box, drop everything overlapping it
    /// by more than the threshold, repeat. Zero-area boxes are dropped first.
    pub fn merge(&self, detections: Vec<BoundingBox>) -> Vec<BoundingBox> {
        let mut candidates: Vec<BoundingBox> =
            detections.into_iter().filter(|b| !b.is_degenerate()).collect();

        // Stable sort: equal scores keep input order, NaN scores go last.
        candidates.sort_by(|a, b| match (a.confidence.is_nan(), b.confidence.is_nan()) {
            (false, false) => b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal),
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (true, true) => Ordering::Equal,
        });

        let mut keep = Vec::new();
        let mut suppressed = vec![false; candidates.len()];

        for i in 0..candidates.len() {
            if suppressed[i] {
                continue;
            }
            keep.push(candidates[i]);

            for j in (i + 1)..candidates.len() {
                if suppressed[j] {
                    continue;
                }
                if overlap_ratio(&candidates[i], &candidates[j]) > self.overlap_threshold {
                    suppressed[j] = true;
                }
            }
        }

        if keep.len() < suppressed.len() {
            tracing::trace!(kept = keep.len(), total = suppressed.len(), "merged detections");
        }
        keep
    }
}

/// Intersection divided by the area of the smaller box.
fn overlap_ratio(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let smaller = a.area().min(b.area());
    if smaller > 0.0 {
        a.intersection(b) / smaller
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox::new(x, y, w, h, conf)
    }

    #[test]
    fn test_overlap_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((overlap_ratio(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_overlap_nested_box_is_full() {
        let outer = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        let inner = make_bbox(10.0, 10.0, 20.0, 20.0, 1.0);
        assert!((overlap_ratio(&outer, &inner) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_overlap_disjoint() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(overlap_ratio(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_merge_suppresses_overlapping() {
        let detections = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = DetectionMerger::default().merge(detections);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_merge_keeps_boxes_under_threshold() {
        // Overlap 2x10 = 20 of 100 -> 0.2, below 0.3
        let detections = vec![
            make_bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            make_bbox(8.0, 0.0, 10.0, 10.0, 0.8),
        ];
        assert_eq!(DetectionMerger::default().merge(detections).len(), 2);
    }

    #[test]
    fn test_merge_drops_degenerate_before_suppression() {
        // The zero-area box has the top score but must not suppress anything.
        let detections = vec![
            make_bbox(0.0, 0.0, 0.0, 100.0, 0.99),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.5),
        ];
        let result = DetectionMerger::default().merge(detections);
        assert_eq!(result.len(), 1);
        assert!((result[0].confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_merge_empty() {
        assert!(DetectionMerger::default().merge(vec![]).is_empty());
    }

    #[test]
    fn test_merge_nan_score_sorted_last() {
        let detections = vec![
            make_bbox(0.0, 0.0, 100.0, 100.0, f32::NAN),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.4),
        ];
        let result = DetectionMerger::default().merge(detections);
        assert_eq!(result.len(), 1);
        assert!((result[0].confidence - 0.4).abs() < 1e-6);
    }
}
