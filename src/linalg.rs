//! Guarded linear algebra: inversions and solves that report condition numbers on failure.

use nalgebra::{DMatrix, DVector};

use crate::error::{BlpError, Result};

/// Condition numbers above this are treated as numerically singular.
pub const SINGULARITY_THRESHOLD: f64 = 1.0 / f64::EPSILON;

/// Ratio of the largest to the smallest singular value (infinite when singular).
pub fn condition_number(matrix: &DMatrix<f64>) -> f64 {
    if matrix.is_empty() {
        return 1.0;
    }
    let singular = matrix.clone().singular_values();
    let largest = singular.max();
    let smallest = singular.min();
    if !largest.is_finite() || !smallest.is_finite() {
        return f64::NAN;
    }
    if smallest <= 0.0 {
        return f64::INFINITY;
    }
    largest / smallest
}

fn check_conditioning(matrix: &DMatrix<f64>, context: &'static str) -> Result<()> {
    let condition = condition_number(matrix);
    if condition.is_nan() {
        return Err(BlpError::NumericalError { context });
    }
    if condition > SINGULARITY_THRESHOLD {
        return Err(BlpError::singular(context, condition));
    }
    Ok(())
}

/// Inverts a square matrix, failing on (near-)singularity.
pub fn invert(matrix: &DMatrix<f64>, context: &'static str) -> Result<DMatrix<f64>> {
    if matrix.nrows() != matrix.ncols() {
        return Err(BlpError::dimension_mismatch(context, matrix.nrows(), matrix.ncols()));
    }
    if matrix.is_empty() {
        return Ok(DMatrix::zeros(0, 0));
    }
    check_conditioning(matrix, context)?;
    let inverse = matrix
        .clone()
        .try_inverse()
        .ok_or_else(|| BlpError::singular(context, f64::INFINITY))?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(BlpError::singular(context, condition_number(matrix)));
    }
    Ok(inverse)
}

/// Inverts a symmetric positive definite matrix via Cholesky, failing on (near-)singularity.
pub fn invert_spd(matrix: &DMatrix<f64>, context: &'static str) -> Result<DMatrix<f64>> {
    if matrix.is_empty() {
        return Ok(DMatrix::zeros(0, 0));
    }
    check_conditioning(matrix, context)?;
    let symmetric = (matrix + matrix.transpose()) * 0.5;
    match nalgebra::linalg::Cholesky::new(symmetric) {
        Some(cholesky) => Ok(cholesky.inverse()),
        None => invert(matrix, context),
    }
}

/// Solves `A X = B` for a square `A`, failing on (near-)singularity.
pub fn solve(a: &DMatrix<f64>, b: &DMatrix<f64>, context: &'static str) -> Result<DMatrix<f64>> {
    if a.nrows() != a.ncols() {
        return Err(BlpError::dimension_mismatch(context, a.nrows(), a.ncols()));
    }
    if a.nrows() != b.nrows() {
        return Err(BlpError::dimension_mismatch(context, a.nrows(), b.nrows()));
    }
    if a.is_empty() {
        return Ok(DMatrix::zeros(0, b.ncols()));
    }
    check_conditioning(a, context)?;
    let solution = a
        .clone()
        .lu()
        .solve(b)
        .ok_or_else(|| BlpError::singular(context, f64::INFINITY))?;
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(BlpError::NumericalError { context });
    }
    Ok(solution)
}

/// Solves `A x = b` for a vector right-hand side.
pub fn solve_vector(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    context: &'static str,
) -> Result<DVector<f64>> {
    let rhs = DMatrix::from_column_slice(b.len(), 1, b.as_slice());
    let solution = solve(a, &rhs, context)?;
    Ok(DVector::from_column_slice(solution.as_slice()))
}

/// Smallest and largest eigenvalues of the symmetric part of `matrix`.
pub fn eigenvalue_range(matrix: &DMatrix<f64>) -> (f64, f64) {
    if matrix.is_empty() || matrix.nrows() != matrix.ncols() {
        return (f64::NAN, f64::NAN);
    }
    let symmetric = (matrix + matrix.transpose()) * 0.5;
    let eigenvalues = symmetric.symmetric_eigenvalues();
    (eigenvalues.min(), eigenvalues.max())
}

/// Block-diagonal concatenation of square or rectangular blocks.
pub fn block_diagonal(blocks: &[&DMatrix<f64>]) -> DMatrix<f64> {
    let rows = blocks.iter().map(|b| b.nrows()).sum();
    let cols = blocks.iter().map(|b| b.ncols()).sum();
    let mut output = DMatrix::zeros(rows, cols);
    let (mut r, mut c) = (0usize, 0usize);
    for block in blocks {
        output
            .view_mut((r, c), (block.nrows(), block.ncols()))
            .copy_from(block);
        r += block.nrows();
        c += block.ncols();
    }
    output
}
