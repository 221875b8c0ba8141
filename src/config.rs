//! Tuning knobs for node layout decisions.

use crate::error::{PhError, Result};

/// Configuration for a [`PhTree`](crate::PhTree).
#[derive(Debug, Clone)]
pub struct Config {
    /// Multiplier on the linear layout's size estimate when choosing between
    /// array (AHC) and linear (LHC) nodes. Larger values favour AHC.
    pub ahc_lhc_bias: f64,
    /// The same bias inside node trees.
    pub nt_ahc_lhc_bias: f64,
    /// Entry count at which a node moves its entries into a node tree.
    pub nt_threshold: usize,
    /// A node tree is flattened again once the node drops to
    /// `nt_threshold - nt_hysteresis` entries.
    pub nt_hysteresis: usize,
    /// Allow array (AHC) nodes at all.
    pub ahc_enabled: bool,
    /// Allow the hypercube incrementer during window queries.
    pub hc_incrementer: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ahc_lhc_bias: 2.0,
            nt_ahc_lhc_bias: 1.5,
            nt_threshold: 150,
            nt_hysteresis: 20,
            ahc_enabled: true,
            hc_incrementer: true,
        }
    }
}

impl Config {
    /// Check that the knobs describe a usable tree.
    pub fn validate(&self) -> Result<()> {
        if !(self.ahc_lhc_bias > 0.0) || !(self.nt_ahc_lhc_bias > 0.0) {
            return Err(PhError::InvalidConfig("AHC/LHC bias must be positive".into()));
        }
        // Nodes with two entries must never be backed by a node tree.
        if self.nt_threshold < self.nt_hysteresis + 3 {
            return Err(PhError::InvalidConfig(format!(
                "nt_threshold ({}) must exceed nt_hysteresis ({}) by at least 3",
                self.nt_threshold, self.nt_hysteresis
            )));
        }
        Ok(())
    }

    /// Entry count at or below which a node tree is flattened.
    #[inline]
    pub(crate) fn nt_floor(&self) -> usize {
        self.nt_threshold - self.nt_hysteresis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let c = Config::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.nt_floor(), 130);
    }

    #[test]
    fn test_rejects_bad_values() {
        let c = Config { nt_threshold: 10, nt_hysteresis: 8, ..Config::default() };
        assert!(matches!(c.validate(), Err(PhError::InvalidConfig(_))));
        let c = Config { ahc_lhc_bias: f64::NAN, ..Config::default() };
        assert!(c.validate().is_err());
        let c = Config { nt_threshold: 5, nt_hysteresis: 2, ..Config::default() };
        assert!(c.validate().is_ok());
    }
}
