use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Utilisation samples recorded for one worker task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsageSample {
    #[serde(default)]
    pub cpu_samples: Vec<f64>,
    #[serde(default)]
    pub memory_samples: Vec<f64>,
}

/// Price per resource unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaRates {
    pub cpu_quota: f64,
    pub memory_quota: f64,
}

#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn get_resource_usage(
        &self,
        external_task_id: &str,
    ) -> Result<Option<ResourceUsageSample>>;
}

#[async_trait]
pub trait QuotaRateSource: Send + Sync {
    async fn get_quota_rates(&self) -> Result<QuotaRates>;
}

/// Cost contribution of one task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskCost {
    pub cpu: f64,
    pub memory: f64,
    /// Charged the flat rate for lack of usable samples
    pub flat_rate: bool,
}

impl TaskCost {
    pub fn total(&self) -> f64 {
        self.cpu + self.memory
    }
}

/// Flat per-unit charge used when samples cannot be trusted
pub fn flat_cost(rates: &QuotaRates) -> TaskCost {
    TaskCost {
        cpu: rates.cpu_quota,
        memory: rates.memory_quota,
        flat_rate: true,
    }
}

/// Rate-weighted cost: every sample multiplied by its resource rate, summed
///
/// Fails with `InsufficientUsageData` when a series has fewer than
/// `min_samples` points or holds a non-finite value.
pub fn weighted_cost(
    task_id: &str,
    sample: &ResourceUsageSample,
    rates: &QuotaRates,
    min_samples: usize,
) -> Result<TaskCost> {
    let insufficient = |reason: String| FlowError::InsufficientUsageData {
        task_id: task_id.to_string(),
        reason,
    };

    for (name, series) in [("cpu", &sample.cpu_samples), ("memory", &sample.memory_samples)] {
        if series.len() < min_samples {
            return Err(insufficient(format!(
                "{} {} samples, need {}",
                series.len(),
                name,
                min_samples
            )));
        }
        if series.iter().any(|v| !v.is_finite()) {
            return Err(insufficient(format!("non-finite {} sample", name)));
        }
    }

    Ok(TaskCost {
        cpu: sample.cpu_samples.iter().map(|v| v * rates.cpu_quota).sum(),
        memory: sample.memory_samples.iter().map(|v| v * rates.memory_quota).sum(),
        flat_rate: false,
    })
}

/// Weighted cost when the sample allows it, flat rate otherwise
pub fn estimate_cost(
    task_id: &str,
    sample: Option<&ResourceUsageSample>,
    rates: &QuotaRates,
    min_samples: usize,
) -> TaskCost {
    let Some(sample) = sample else {
        tracing::warn!("No usage recorded for {}, charging flat rate", task_id);
        return flat_cost(rates);
    };

    match weighted_cost(task_id, sample, rates, min_samples) {
        Ok(cost) => cost,
        Err(err) => {
            tracing::warn!("{}, charging flat rate", err);
            flat_cost(rates)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATES: QuotaRates = QuotaRates {
        cpu_quota: 0.5,
        memory_quota: 0.25,
    };

    fn sample(n: usize, cpu: f64, memory: f64) -> ResourceUsageSample {
        ResourceUsageSample {
            cpu_samples: vec![cpu; n],
            memory_samples: vec![memory; n],
        }
    }

    #[test]
    fn test_weighted_cost() {
        let cost = weighted_cost("t1", &sample(60, 1.0, 2.0), &RATES, 60).unwrap();
        assert_eq!(cost.cpu, 30.0);
        assert_eq!(cost.memory, 30.0);
        assert_eq!(cost.total(), 60.0);
        assert!(!cost.flat_rate);
    }

    #[test]
    fn test_too_few_samples() {
        let err = weighted_cost("t1", &sample(10, 1.0, 1.0), &RATES, 60).unwrap_err();
        assert!(matches!(err, FlowError::InsufficientUsageData { .. }));

        let cost = estimate_cost("t1", Some(&sample(10, 1.0, 1.0)), &RATES, 60);
        assert!(cost.flat_rate);
        assert_eq!(cost.total(), 0.75);
    }

    #[test]
    fn test_non_finite_sample() {
        let mut bad = sample(60, 1.0, 1.0);
        bad.memory_samples[3] = f64::NAN;
        assert!(weighted_cost("t1", &bad, &RATES, 60).is_err());
        assert!(estimate_cost("t1", Some(&bad), &RATES, 60).flat_rate);
    }

    #[test]
    fn test_missing_sample_uses_flat_rate() {
        let cost = estimate_cost("t1", None, &RATES, 60);
        assert_eq!(cost, flat_cost(&RATES));
    }
}
