use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use sluice_common::config::ThrottleThresholds;
use sluice_common::models::Priority;
use sysinfo::System;

// Weights in percent; they sum to 100.
const CPU_WEIGHT: f64 = 40.0;
const MEMORY_WEIGHT: f64 = 30.0;
const QUEUE_WEIGHT: f64 = 15.0;
const CONNECTION_WEIGHT: f64 = 15.0;

/// Host utilization, both in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

pub trait SystemProbe: Send + Sync {
    fn sample(&self) -> SystemSample;
}

/// Reads host CPU and memory through `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&self) -> SystemSample {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();
        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };
        SystemSample {
            cpu_percent: system.global_cpu_usage() as f64,
            memory_percent,
        }
    }
}

/// Fixed readings that tests can move.
#[derive(Default)]
pub struct StaticProbe {
    cpu: AtomicU64,
    memory: AtomicU64,
}

impl StaticProbe {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        let probe = Self::default();
        probe.set(cpu_percent, memory_percent);
        probe
    }

    pub fn set(&self, cpu_percent: f64, memory_percent: f64) {
        self.cpu.store(cpu_percent.to_bits(), Ordering::Relaxed);
        self.memory.store(memory_percent.to_bits(), Ordering::Relaxed);
    }
}

impl SystemProbe for StaticProbe {
    fn sample(&self) -> SystemSample {
        SystemSample {
            cpu_percent: f64::from_bits(self.cpu.load(Ordering::Relaxed)),
            memory_percent: f64::from_bits(self.memory.load(Ordering::Relaxed)),
        }
    }
}

/// Inputs of one pressure computation. Ratios are 0.0 - 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LoadReading {
    pub system: SystemSample,
    pub queue_ratio: f64,
    pub connection_ratio: f64,
}

/// 0 - 100 pressure score. Rises at once, falls by at most `relax_step`
/// per sample.
pub(crate) struct PressureGauge {
    score: Mutex<f64>,
    relax_step: f64,
    thresholds: ThrottleThresholds,
    last_sample: Mutex<SystemSample>,
}

impl PressureGauge {
    pub(crate) fn new(relax_step: f64, thresholds: ThrottleThresholds) -> Self {
        Self {
            score: Mutex::new(0.0),
            relax_step: relax_step.max(0.0),
            thresholds,
            last_sample: Mutex::new(SystemSample::default()),
        }
    }

    pub(crate) fn update(&self, reading: LoadReading) -> f64 {
        let weighted = CPU_WEIGHT * reading.system.cpu_percent.clamp(0.0, 100.0)
            + MEMORY_WEIGHT * reading.system.memory_percent.clamp(0.0, 100.0)
            + QUEUE_WEIGHT * reading.queue_ratio.clamp(0.0, 1.0) * 100.0
            + CONNECTION_WEIGHT * reading.connection_ratio.clamp(0.0, 1.0) * 100.0;
        let raw = (weighted / 100.0).clamp(0.0, 100.0);

        *self.last_sample.lock() = reading.system;
        let mut score = self.score.lock();
        *score = if raw >= *score {
            raw
        } else {
            raw.max(*score - self.relax_step)
        };
        *score
    }

    pub(crate) fn score(&self) -> f64 {
        *self.score.lock()
    }

    pub(crate) fn last_sample(&self) -> SystemSample {
        *self.last_sample.lock()
    }

    fn threshold(&self, priority: Priority) -> Option<f64> {
        match priority {
            Priority::Critical => None,
            Priority::High => Some(self.thresholds.high),
            Priority::Normal => Some(self.thresholds.normal),
            Priority::Low => Some(self.thresholds.low),
            Priority::Background => Some(self.thresholds.background),
        }
    }

    /// Critical work is never held back.
    pub(crate) fn allows(&self, priority: Priority) -> bool {
        match self.threshold(priority) {
            None => true,
            Some(limit) => self.score() < limit,
        }
    }

    pub(crate) fn throttled(&self) -> Vec<Priority> {
        Priority::ALL
            .into_iter()
            .filter(|p| !self.allows(*p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(cpu: f64, memory: f64) -> LoadReading {
        LoadReading {
            system: SystemSample {
                cpu_percent: cpu,
                memory_percent: memory,
            },
            queue_ratio: 0.0,
            connection_ratio: 0.0,
        }
    }

    #[test]
    fn test_score_rises_immediately_and_relaxes_gradually() {
        let gauge = PressureGauge::new(5.0, ThrottleThresholds::default());
        assert_eq!(gauge.update(reading(100.0, 100.0)), 70.0);
        assert_eq!(gauge.update(reading(0.0, 0.0)), 65.0);
        assert_eq!(gauge.update(reading(0.0, 0.0)), 60.0);
        assert_eq!(gauge.update(reading(100.0, 100.0)), 70.0);
    }

    #[test]
    fn test_thresholds_by_priority() {
        let gauge = PressureGauge::new(5.0, ThrottleThresholds::default());
        gauge.update(LoadReading {
            system: SystemSample {
                cpu_percent: 100.0,
                memory_percent: 100.0,
            },
            queue_ratio: 1.0,
            connection_ratio: 1.0,
        });
        assert_eq!(gauge.score(), 100.0);
        assert!(gauge.allows(Priority::Critical));
        assert!(!gauge.allows(Priority::High));
        assert_eq!(gauge.throttled().len(), 4);

        let calm = PressureGauge::new(5.0, ThrottleThresholds::default());
        calm.update(reading(100.0, 100.0));
        assert!(calm.allows(Priority::Normal));
        assert!(!calm.allows(Priority::Low));
        assert!(!calm.allows(Priority::Background));
    }

    #[test]
    fn test_static_probe() {
        let probe = StaticProbe::new(12.5, 40.0);
        assert_eq!(probe.sample().cpu_percent, 12.5);
        probe.set(90.0, 10.0);
        assert_eq!(probe.sample().memory_percent, 10.0);
    }
}
