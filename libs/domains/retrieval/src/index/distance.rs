//! Distance functions shared by the IVF index and the exact scan.
//!
//! All metrics are reported as distances, smaller = closer, so ranking code
//! never has to branch on the metric.

use crate::models::DistanceMetric;

/// Distance reported for cosine comparisons involving a zero vector
pub const MAX_COSINE_DISTANCE: f32 = 2.0;

pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Dimension mismatch in distance computation");

    match metric {
        DistanceMetric::Cosine => cosine_distance(a, b),
        DistanceMetric::L2 => l2_distance(a, b),
        DistanceMetric::DotProduct => -dot(a, b),
    }
}

/// `1 - cos(a, b)`; a zero-norm operand yields the maximal distance
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = norm(a);
    let norm_b = norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        return MAX_COSINE_DISTANCE;
    }
    let cos = (dot(a, b) / (norm_a * norm_b)).clamp(-1.0, 1.0);
    1.0 - cos
}

pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    squared_l2(a, b).sqrt()
}

pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}
