//! Beam position estimate from the four pickup electrodes.
//!
//! Buttons are arranged so that A and D sit on the positive X side and A and
//! B on the positive Y side. Positions come out in millimetres.

use serde::{Deserialize, Serialize};

/// Geometric scale factor of the difference-over-sum estimate (mm).
pub const K: f64 = 10.0;

/// Signal levels on the four BPM buttons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ButtonSignals {
    /// Button A
    pub a: f64,
    /// Button B
    pub b: f64,
    /// Button C
    pub c: f64,
    /// Button D
    pub d: f64,
}

impl ButtonSignals {
    /// Build from the four levels in A, B, C, D order.
    pub fn new(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self { a, b, c, d }
    }

    /// Same level on every button.
    pub fn uniform(level: f64) -> Self {
        Self::new(level, level, level, level)
    }

    /// Sum of all four buttons.
    pub fn sum(&self) -> f64 {
        self.a + self.b + self.c + self.d
    }

    /// Each button divided by the mean button level.
    pub fn normalised(&self) -> Self {
        let mean = self.sum() / 4.0;
        Self::new(self.a / mean, self.b / mean, self.c / mean, self.d / mean)
    }

    /// Horizontal position estimate.
    pub fn x_position(&self) -> f64 {
        calc_x_pos(self.a, self.b, self.c, self.d)
    }

    /// Vertical position estimate.
    pub fn y_position(&self) -> f64 {
        calc_y_pos(self.a, self.b, self.c, self.d)
    }

    /// Values as an array in A, B, C, D order.
    pub fn to_array(&self) -> [f64; 4] {
        [self.a, self.b, self.c, self.d]
    }
}

/// Horizontal position: `K * ((a + d) - (b + c)) / sum`.
pub fn calc_x_pos(a: f64, b: f64, c: f64, d: f64) -> f64 {
    K * ((a + d) - (b + c)) / (a + b + c + d)
}

/// Vertical position: `K * ((a + b) - (c + d)) / sum`.
pub fn calc_y_pos(a: f64, b: f64, c: f64, d: f64) -> f64 {
    K * ((a + b) - (c + d)) / (a + b + c + d)
}
