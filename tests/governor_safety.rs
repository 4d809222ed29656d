use std::collections::VecDeque;

use load_governor::governor::{EmergencyStop, Governor, Limits};
use load_governor::sampler::{Probe, ProbeError, RawSample, Reading};
use load_governor::{Actuation, ControlConfig, Controller, ResourceKind, SessionParts, SimulatedPlant, Target};
use proptest::prelude::*;

/// Replays arbitrary, often nonsensical, measurements.
struct Adversary(VecDeque<RawSample>);

impl Probe for Adversary {
    fn measure(&mut self) -> Result<RawSample, ProbeError> {
        self.0
            .pop_front()
            .ok_or_else(|| ProbeError::Unavailable("script exhausted".into()))
    }
}

fn raw_sample() -> impl Strategy<Value = RawSample> {
    (-1e6f64..1e6, 0u64..1 << 40, 0u64..1 << 40).prop_map(|(percent, available, total)| RawSample {
        percent,
        used_bytes: total.saturating_sub(available),
        available_bytes: available,
        total_bytes: total,
    })
}

fn reading() -> impl Strategy<Value = Reading> {
    (raw_sample(), any::<bool>()).prop_map(|(raw, stale)| Reading {
        percent: raw.percent,
        raw_percent: raw.percent,
        used_bytes: raw.used_bytes,
        available_bytes: raw.available_bytes,
        total_bytes: raw.total_bytes,
        stale,
        ..Reading::empty(ResourceKind::Memory)
    })
}

fn actuation() -> impl Strategy<Value = Actuation> {
    prop_oneof![
        (0usize..10_000, -10.0f64..10.0).prop_map(|(workers, duty)| Actuation::Cpu { workers, duty }),
        any::<u64>().prop_map(|bytes| Actuation::Memory { bytes }),
    ]
}

fn limits() -> impl Strategy<Value = Limits> {
    (1usize..64, 0.01f64..=1.0, proptest::option::of(1u64..1 << 40), 0u64..1 << 36).prop_map(
        |(max_workers, max_duty, max_memory_bytes, min_free_memory_bytes)| Limits {
            max_workers,
            max_duty,
            max_memory_bytes,
            min_free_memory_bytes,
        },
    )
}

proptest! {
    #[test]
    fn clamp_never_raises_and_respects_ceilings(
        limits in limits(),
        requested in actuation(),
        reading in reading(),
        held in any::<u64>(),
    ) {
        let governor = Governor::new(limits.clone(), EmergencyStop::new());
        let clamp = governor.clamp(requested, &reading, Actuation::Memory { bytes: held });
        prop_assert_eq!(clamp.vetoed, clamp.allowed != requested);
        match (requested, clamp.allowed) {
            (Actuation::Cpu { workers, duty }, Actuation::Cpu { workers: w, duty: d }) => {
                prop_assert!(w <= workers && w <= limits.max_workers);
                prop_assert!(d <= limits.max_duty && d >= 0.0);
                prop_assert!(d <= duty.max(0.0));
            }
            (Actuation::Memory { bytes }, Actuation::Memory { bytes: b }) => {
                prop_assert!(b <= bytes);
                if let Some(max) = limits.max_memory_bytes {
                    prop_assert!(b <= max);
                }
            }
            (req, allowed) => prop_assert!(false, "kind changed: {:?} -> {:?}", req, allowed),
        }
    }

    #[test]
    fn adversarial_readings_never_push_cpu_past_ceilings(
        samples in proptest::collection::vec(raw_sample(), 1..60),
        max_workers in 1usize..8,
        max_duty in 0.05f64..=1.0,
        target in 0.0f64..=100.0,
    ) {
        let plant = SimulatedPlant::new(0.0, 16, 0);
        let config = ControlConfig { max_workers, max_duty, ..ControlConfig::default() };
        let ticks = samples.len();
        let parts = SessionParts {
            probe: Box::new(Adversary(samples.into_iter().collect())),
            pool: Box::new(plant.pool(ResourceKind::Cpu)),
            logical_cpus: 16,
            emergency: EmergencyStop::new(),
            coordinator: None,
        };
        let mut controller = Controller::new("cpu-adversary".into(), ResourceKind::Cpu, Target::new(target).unwrap(), &config, parts);
        controller.start();
        for _ in 0..ticks {
            controller.tick();
        }
        for applied in plant.applied() {
            match applied {
                Actuation::Cpu { workers, duty } => {
                    prop_assert!(workers <= max_workers);
                    prop_assert!(duty <= max_duty);
                }
                other => prop_assert!(false, "memory actuation on a cpu pool: {:?}", other),
            }
        }
    }

    #[test]
    fn adversarial_readings_never_push_memory_past_ceiling(
        samples in proptest::collection::vec(raw_sample(), 1..60),
        max_memory in 1u64..1 << 32,
        target in 0.0f64..=100.0,
    ) {
        let plant = SimulatedPlant::new(0.0, 1, 1 << 33);
        let config = ControlConfig {
            max_memory_bytes: Some(max_memory),
            min_free_memory_bytes: 0,
            ..ControlConfig::default()
        };
        let ticks = samples.len();
        let parts = SessionParts {
            probe: Box::new(Adversary(samples.into_iter().collect())),
            pool: Box::new(plant.pool(ResourceKind::Memory)),
            logical_cpus: 1,
            emergency: EmergencyStop::new(),
            coordinator: None,
        };
        let mut controller = Controller::new("memory-adversary".into(), ResourceKind::Memory, Target::new(target).unwrap(), &config, parts);
        controller.start();
        for _ in 0..ticks {
            controller.tick();
        }
        for applied in plant.applied() {
            prop_assert!(applied.bytes() <= max_memory, "{:?} exceeds {}", applied, max_memory);
        }
    }
}
