use ndarray::{Array1, ArrayView1};

/// Norm below which a vector is treated as zero
pub(crate) const ZERO_NORM: f64 = 1e-10;

pub(crate) fn l2_norm(vec: ArrayView1<f32>) -> f32 {
    vec.iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt() as f32
}

/// Unit-norm mean of `count` vectors summed in f64. Zero if the mean is zero.
pub(crate) fn normalized_mean(sum: &Array1<f64>, count: usize) -> Array1<f32> {
    if count == 0 {
        return Array1::zeros(sum.len());
    }
    let mean = sum / count as f64;
    let norm = mean.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > ZERO_NORM && norm.is_finite() {
        mean.mapv(|x| (x / norm) as f32)
    } else {
        Array1::zeros(sum.len())
    }
}

pub(crate) fn is_zero_vector(vec: ArrayView1<f32>) -> bool {
    vec.iter().all(|&x| x == 0.0)
}
