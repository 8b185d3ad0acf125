use nalgebra::Matrix2;

/// Second moments of an elliptical distribution: the symmetric 2x2 matrix
/// [[ixx, ixy], [ixy, iyy]]. Used both for the object's measured shape and
/// for the covariance of the Gaussian weight function.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Quadrupole {
    pub ixx: f64,
    pub ixy: f64,
    pub iyy: f64,
}

/// The same ellipse described by its principal axes. `a` and `b` are the
/// semi-axis lengths (square roots of the eigenvalues, a >= b) and `theta`
/// is the angle of the major axis from +x, in radians.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Axes {
    pub a: f64,
    pub b: f64,
    pub theta: f64,
}

impl Quadrupole {
    pub fn new(ixx: f64, ixy: f64, iyy: f64) -> Self {
        Quadrupole{ixx, ixy, iyy}
    }

    pub fn determinant(&self) -> f64 {
        self.ixx * self.iyy - self.ixy * self.ixy
    }

    pub fn trace(&self) -> f64 {
        self.ixx + self.iyy
    }

    pub fn has_nan(&self) -> bool {
        self.ixx.is_nan() || self.ixy.is_nan() || self.iyy.is_nan()
    }

    pub fn matrix(&self) -> Matrix2<f64> {
        Matrix2::new(self.ixx, self.ixy,
                     self.ixy, self.iyy)
    }

    pub fn from_matrix(m: &Matrix2<f64>) -> Self {
        // Average the off-diagonal terms; inverses of symmetric matrices can
        // pick up asymmetric rounding.
        Quadrupole{ixx: m[(0, 0)], ixy: 0.5 * (m[(0, 1)] + m[(1, 0)]), iyy: m[(1, 1)]}
    }

    /// Returns the inverse matrix, or None if it is singular.
    pub fn inverse(&self) -> Option<Quadrupole> {
        self.matrix().try_inverse().map(|m| Quadrupole::from_matrix(&m))
    }

    /// Decomposes into principal axes. Returns None if the matrix is not
    /// positive semi-definite (beyond rounding), in which case there is no
    /// ellipse to speak of.
    pub fn to_axes(&self) -> Option<Axes> {
        let sum = self.ixx + self.iyy;
        let diff = self.ixx - self.iyy;
        let t = (diff * diff + 4.0 * self.ixy * self.ixy).sqrt();
        let a2 = 0.5 * (sum + t);
        let b2 = 0.5 * (sum - t);
        let tolerance = f32::EPSILON as f64 * (1.0 + a2.abs());
        if !(b2 >= -tolerance) {
            return None;
        }
        let theta = if t == 0.0 { 0.0 } else { 0.5 * (2.0 * self.ixy).atan2(diff) };
        Some(Axes{a: a2.max(0.0).sqrt(), b: b2.max(0.0).sqrt(), theta})
    }

    pub fn from_axes(axes: &Axes) -> Self {
        let (sin, cos) = axes.theta.sin_cos();
        let a2 = axes.a * axes.a;
        let b2 = axes.b * axes.b;
        Quadrupole{ixx: a2 * cos * cos + b2 * sin * sin,
                   ixy: (a2 - b2) * sin * cos,
                   iyy: a2 * sin * sin + b2 * cos * cos}
    }

    /// Ellipticity components (e1, e2) = ((ixx-iyy)/(ixx+iyy), 2ixy/(ixx+iyy)).
    pub fn ellipticity(&self) -> (f64, f64) {
        let d = self.trace();
        ((self.ixx - self.iyy) / d, 2.0 * self.ixy / d)
    }
}
