//! Flattening of named parameter blocks.
//!
//! Objectives often think in blocks (a scalar noise level, a vector of length
//! scales, a weight matrix) while optimizers want one flat vector. Blocks are
//! `ArrayD<f64>` values of any shape, a scalar being the zero-dimensional
//! array. Flattening walks each block in logical (row-major) order and
//! concatenates the results; [`structure`] is its exact inverse.

use super::OptimizeError;
use ndarray::{Array1, ArrayD, ArrayView1, IxDyn};

/// The shape of every block, in order.
pub fn shapes_of(blocks: &[ArrayD<f64>]) -> Vec<Vec<usize>> {
    blocks.iter().map(|b| b.shape().to_vec()).collect()
}

/// Total number of scalars described by `shapes`.
pub fn total_size(shapes: &[Vec<usize>]) -> usize {
    shapes.iter().map(|s| s.iter().product::<usize>()).sum()
}

/// Concatenates the blocks into one vector.
pub fn flatten(blocks: &[ArrayD<f64>]) -> Array1<f64> {
    Array1::from_iter(blocks.iter().flat_map(|b| b.iter().copied()))
}

/// Splits a flat vector back into blocks of the given shapes.
pub fn structure(
    flat: ArrayView1<f64>,
    shapes: &[Vec<usize>],
) -> Result<Vec<ArrayD<f64>>, OptimizeError> {
    let expected = total_size(shapes);
    if flat.len() != expected {
        return Err(OptimizeError::ShapeMismatch {
            context: "flat vector versus block shapes",
            expected,
            found: flat.len(),
        });
    }

    let mut offset = 0;
    let mut blocks = Vec::with_capacity(shapes.len());
    for shape in shapes {
        let size: usize = shape.iter().product();
        let values = flat.slice(ndarray::s![offset..offset + size]).to_vec();
        let block = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
            OptimizeError::ShapeMismatch {
                context: "block reshape",
                expected: size,
                found: size,
            }
        })?;
        blocks.push(block);
        offset += size;
    }
    Ok(blocks)
}

/// Flattens gradient blocks after checking them against the parameter shapes.
pub(crate) fn flatten_matching(
    blocks: &[ArrayD<f64>],
    shapes: &[Vec<usize>],
) -> Result<Array1<f64>, OptimizeError> {
    if blocks.len() != shapes.len() {
        return Err(OptimizeError::ShapeMismatch {
            context: "number of gradient blocks",
            expected: shapes.len(),
            found: blocks.len(),
        });
    }
    for (block, shape) in blocks.iter().zip(shapes) {
        if block.shape() != shape.as_slice() {
            return Err(OptimizeError::ShapeMismatch {
                context: "gradient block size",
                expected: shape.iter().product(),
                found: block.len(),
            });
        }
    }
    Ok(flatten(blocks))
}

/// Repeats one bound per block across every element of that block.
pub(crate) fn expand_bounds<T: Copy>(
    per_block: &[T],
    shapes: &[Vec<usize>],
) -> Result<Vec<T>, OptimizeError> {
    if per_block.len() != shapes.len() {
        return Err(OptimizeError::ShapeMismatch {
            context: "number of block bounds",
            expected: shapes.len(),
            found: per_block.len(),
        });
    }
    Ok(per_block
        .iter()
        .zip(shapes)
        .flat_map(|(&b, s)| std::iter::repeat_n(b, s.iter().product()))
        .collect())
}
