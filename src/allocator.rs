//! Distribution of a group's target amplitude across its children.
//!
//! Starting from an even share `s = T / n`, every child whose maximum is below
//! `s` is saturated at its maximum. The amplitude those children could not take
//! is spread evenly over the remaining children as `s' = s + deficit / (n - k)`.
//!
//! This is a single pass: a child that fits `s` but not `s'` is not
//! re-balanced, so an individual share may exceed that child's maximum. The
//! group total never exceeds the sum of the maxima because the target is
//! clamped to that sum first.

use serde::{Deserialize, Serialize};

/// Per-child input to an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildAmplitude {
    /// Current amplitude setpoint (MV)
    pub setpoint: f64,
    /// Amplitude ceiling (MV)
    pub max: f64,
}

/// Result of an allocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Allocation {
    /// The children already sum to the target; leave every setpoint alone.
    Unchanged,
    /// New setpoints, in child order.
    Assigned(Vec<f64>),
}

impl Allocation {
    /// Shares to apply, falling back to the current setpoints when unchanged.
    pub fn shares(&self, children: &[ChildAmplitude]) -> Vec<f64> {
        match self {
            Allocation::Unchanged => children.iter().map(|c| c.setpoint).collect(),
            Allocation::Assigned(shares) => shares.clone(),
        }
    }
}

/// Splits a target amplitude across children subject to their maxima.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AmplitudeAllocator {
    tolerance: f64,
}

impl Default for AmplitudeAllocator {
    fn default() -> Self {
        Self { tolerance: 1e-6 }
    }
}

impl AmplitudeAllocator {
    /// Create an allocator that treats sums within `tolerance` as equal.
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance: tolerance.abs(),
        }
    }

    /// Distribute `target` across `children`.
    pub fn allocate(&self, target: f64, children: &[ChildAmplitude]) -> Allocation {
        let n = children.len();
        if n == 0 {
            return Allocation::Assigned(Vec::new());
        }

        let capacity: f64 = children.iter().map(|c| c.max).sum();
        let target = target.max(0.0).min(capacity);

        let current: f64 = children.iter().map(|c| c.setpoint).sum();
        if (current - target).abs() <= self.tolerance {
            return Allocation::Unchanged;
        }

        let share = target / n as f64;
        let saturated: Vec<bool> = children.iter().map(|c| c.max < share).collect();
        let k = saturated.iter().filter(|s| **s).count();

        if k == n {
            return Allocation::Assigned(children.iter().map(|c| c.max).collect());
        }

        let deficit: f64 = children
            .iter()
            .zip(&saturated)
            .filter(|(_, saturated)| **saturated)
            .map(|(c, _)| share - c.max)
            .sum();
        let boosted = share + deficit / (n - k) as f64;

        Allocation::Assigned(
            children
                .iter()
                .zip(&saturated)
                .map(|(c, saturated)| if *saturated { c.max } else { boosted })
                .collect(),
        )
    }
}
