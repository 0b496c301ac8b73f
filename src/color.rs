/// Color matrix helpers
///
/// The catalog stores the camera's D65 color matrix as a 9-float blob
/// (row-major). Modules only need to know whether it is usable and, for the
/// legacy white balance defaults, which per-channel coefficients it implies.

/// Check if a color matrix is the identity matrix (no conversion)
pub fn is_identity_matrix(matrix: &[f32; 9]) -> bool {
    const EPSILON: f32 = 0.001;

    (matrix[0] - 1.0).abs() < EPSILON && matrix[1].abs() < EPSILON && matrix[2].abs() < EPSILON &&
    matrix[3].abs() < EPSILON && (matrix[4] - 1.0).abs() < EPSILON && matrix[5].abs() < EPSILON &&
    matrix[6].abs() < EPSILON && matrix[7].abs() < EPSILON && (matrix[8] - 1.0).abs() < EPSILON
}

/// A matrix is usable when every coefficient is finite and no row is empty.
pub fn is_usable_matrix(matrix: &[f32; 9]) -> bool {
    matrix.iter().all(|v| v.is_finite())
        && matrix
            .chunks_exact(3)
            .all(|row| row.iter().map(|v| v.abs()).sum::<f32>() > f32::EPSILON)
}

/// Camera white balance coefficients implied by the matrix, normalized to green.
///
/// # Returns
/// * `[red, green, blue, green2]` multipliers; identity when the matrix is unusable
pub fn as_shot_coefficients(matrix: &[f32; 9]) -> [f32; 4] {
    if !is_usable_matrix(matrix) || is_identity_matrix(matrix) {
        return [1.0, 1.0, 1.0, 1.0];
    }

    let row_sum = |r: usize| matrix[r * 3..r * 3 + 3].iter().sum::<f32>();
    let (red, green, blue) = (row_sum(0), row_sum(1), row_sum(2));
    if red.abs() < f32::EPSILON || blue.abs() < f32::EPSILON {
        return [1.0, 1.0, 1.0, 1.0];
    }

    [green / red, 1.0, green / blue, 1.0]
}
