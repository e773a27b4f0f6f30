//! Unit conversions and numeric helpers shared by drivers and sweeps.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, HarnessError};

/// A reading as a number plus the textual form the device reported.
///
/// Real instruments answer with strings such as `-70.00dBm`; simulated
/// devices render their state the same way so reports look alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    /// Numeric value in the unit implied by the call (dBm, MHz, us)
    pub value: f64,
    /// Value with units as text
    pub text: String,
}

impl Quantity {
    /// Build a quantity from a value and a unit suffix.
    pub fn new(value: f64, unit: &str) -> Self {
        Self {
            value,
            text: format!("{}{}", value, unit),
        }
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// `n` evenly spaced samples from `start` to `end`, both inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Round to the nearest 0.25, the attenuator step size.
pub fn quarter_round(x: f64) -> f64 {
    (x * 4.0).round() / 4.0
}

/// dBm to milliwatts.
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Milliwatts to dBm.
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// Split a reply into its numeric characters and everything else.
///
/// Digits, `.` and `-` belong to the number; the rest is the unit.
pub fn split_number_unit(s: &str) -> (String, String) {
    s.chars()
        .partition(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
}

/// Parse a device reply such as `-70.5dBm` into a [`Quantity`].
///
/// Plain numbers (including exponent notation) are taken as they are.
pub fn parse_quantity(reply: &str) -> AppResult<Quantity> {
    if let Ok(value) = reply.trim().parse::<f64>() {
        return Ok(Quantity {
            value,
            text: reply.to_string(),
        });
    }
    let (number, _unit) = split_number_unit(reply);
    let value = number
        .parse::<f64>()
        .map_err(|e| HarnessError::parse(reply, e))?;
    Ok(Quantity {
        value,
        text: reply.to_string(),
    })
}

/// Parse a single float reply, ignoring surrounding whitespace.
pub fn parse_f64(reply: &str) -> AppResult<f64> {
    reply
        .trim()
        .parse::<f64>()
        .map_err(|e| HarnessError::parse(reply, e))
}

/// Parse a whitespace separated list of floats.
pub fn parse_f64_list(reply: &str) -> AppResult<Vec<f64>> {
    reply.split_whitespace().map(parse_f64).collect()
}

/// Arithmetic mean; `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Root mean square; `None` for an empty slice.
pub fn rms(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mean_square = values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64;
    Some(mean_square.sqrt())
}

/// Every `stride`-th element starting at `offset`.
pub fn deinterleave(values: &[f64], offset: usize, stride: usize) -> Vec<f64> {
    values.iter().skip(offset).step_by(stride.max(1)).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linspace_endpoints() {
        let v = linspace(-100.0, 0.0, 11);
        assert_eq!(v.len(), 11);
        assert_eq!(v[0], -100.0);
        assert_eq!(v[10], 0.0);
        assert!((v[5] - -50.0).abs() < 1e-12);
    }

    #[test]
    fn test_linspace_degenerate() {
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(0.3, 1.0, 1), vec![0.3]);
    }

    #[test]
    fn test_quarter_round() {
        assert_eq!(quarter_round(1.1), 1.0);
        assert_eq!(quarter_round(1.13), 1.25);
        assert_eq!(quarter_round(-2.6), -2.5);
    }

    #[test]
    fn test_dbm_conversion() {
        assert!((dbm_to_mw(0.0) - 1.0).abs() < 1e-12);
        assert!((dbm_to_mw(10.0) - 10.0).abs() < 1e-12);
        assert!((mw_to_dbm(100.0) - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_split_number_unit() {
        assert_eq!(
            split_number_unit("-70.5dBm"),
            ("-70.5".to_string(), "dBm".to_string())
        );
        assert_eq!(
            split_number_unit("3.5uS"),
            ("3.5".to_string(), "uS".to_string())
        );
    }

    #[test]
    fn test_parse_quantity() {
        let q = parse_quantity("499.6817682MHz").unwrap();
        assert_eq!(q.value, 499.6817682);
        assert_eq!(q.text, "499.6817682MHz");
        assert_eq!(parse_quantity("3.0e-06").unwrap().value, 3.0e-6);
        assert!(parse_quantity("dBm").is_err());
    }

    #[test]
    fn test_mean_and_rms() {
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(rms(&[3.0, -3.0]), Some(3.0));
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_deinterleave() {
        let v = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0];
        assert_eq!(deinterleave(&v, 0, 2), vec![1.0, 2.0, 3.0]);
        assert_eq!(deinterleave(&v, 1, 2), vec![10.0, 20.0, 30.0]);
    }
}
