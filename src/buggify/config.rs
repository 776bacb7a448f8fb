//! Fault probability configuration

use super::faults;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Global switch; when false no fault fires
    pub enabled: bool,
    /// Multiplier applied to every configured probability
    pub global_multiplier: f64,
    probabilities: HashMap<String, f64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultConfig {
    /// Enabled, no per-fault probabilities set
    pub fn new() -> Self {
        FaultConfig {
            enabled: true,
            global_multiplier: 1.0,
            probabilities: HashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            ..Self::new()
        }
    }

    /// ~1% failures per site, rare hangs and session loss
    pub fn moderate() -> Self {
        let mut config = Self::new();
        for id in faults::ALL_FAULTS {
            config.set(id, 0.01);
        }
        config.set(faults::segment::HANG, 0.002);
        config.set(faults::metadata::HANG, 0.002);
        config.set(faults::metadata::SESSION_LOSS, 0.002);
        config
    }

    pub fn chaos() -> Self {
        let mut config = Self::new();
        for id in faults::ALL_FAULTS {
            config.set(id, 0.05);
        }
        config.set(faults::segment::HANG, 0.01);
        config.set(faults::metadata::HANG, 0.01);
        config
    }

    pub fn set(&mut self, fault_id: &str, probability: f64) -> &mut Self {
        self.probabilities
            .insert(fault_id.to_string(), probability.clamp(0.0, 1.0));
        self
    }

    /// Effective probability for a fault (0 when disabled or unset)
    pub fn get(&self, fault_id: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        let base = self.probabilities.get(fault_id).copied().unwrap_or(0.0);
        (base * self.global_multiplier).clamp(0.0, 1.0)
    }
}
