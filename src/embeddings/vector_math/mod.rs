// Vector math helpers shared by storage, search and the processor.
// Every stored vector is L2-normalized, so similarity reduces to a dot product.


/// Maximum deviation of a vector's L2 norm from 1.0 before it is re-normalized
pub const NORM_EPSILON: f32 = 0.015;

/// Size in bytes of one encoded vector component
const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Compute the L2 norm of a vector
#[inline]
pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Return a unit-length copy of `vector`, or `None` when the norm is zero or not finite
#[inline]
pub fn normalize(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = l2_norm(vector);
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(vector.iter().map(|v| v / norm).collect())
}

/// Whether the vector's norm is within [`NORM_EPSILON`] of 1.0
#[inline]
pub fn is_unit_length(vector: &[f32]) -> bool {
    (l2_norm(vector) - 1.0).abs() <= NORM_EPSILON
}

/// Dot product over the shared prefix of both slices
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Whether every component is a finite number
#[inline]
pub fn all_finite(vector: &[f32]) -> bool {
    vector.iter().all(|v| v.is_finite())
}

/// Coerce a JSON-decoded `f64` vector into the canonical `f32` representation
#[inline]
pub fn coerce_f64(values: &[f64]) -> Vec<f32> {
    values.iter().map(|v| *v as f32).collect()
}

/// Encode a vector as a little-endian `f32` byte buffer
#[inline]
pub fn to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * F32_BYTES);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// How a stored vector buffer was encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorEncoding {
    /// Little-endian `f32` buffer
    Binary,
    /// JSON array of numbers written by older versions
    LegacyJson,
}

/// Decode a stored vector buffer.
///
/// Canonical buffers are little-endian `f32`. Buffers holding a JSON array of
/// numbers are accepted and coerced. Anything else yields `None`.
#[inline]
pub fn from_bytes(bytes: &[u8]) -> Option<(Vec<f32>, VectorEncoding)> {
    if bytes.first() == Some(&b'[') && bytes.last() == Some(&b']') {
        if let Ok(values) = serde_json::from_slice::<Vec<f64>>(bytes) {
            return Some((coerce_f64(&values), VectorEncoding::LegacyJson));
        }
    }

    if bytes.len() % F32_BYTES != 0 {
        return None;
    }

    let vector = bytes
        .chunks_exact(F32_BYTES)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Some((vector, VectorEncoding::Binary))
}
