//! Model build and solve times for growing horizons.
//!
//! ```bash
//! cargo bench --bench device_scheduler
//! ```

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use open_energy_scheduler::controller::{Scheduler, SchedulerSettings};
use open_energy_scheduler::domain::{
    Commitment, Device, DeviceId, EfficiencyMode, Grouping, StockModel, TimeGrid,
};
use open_energy_scheduler::optimizer::{
    backend_for, ConstraintBuilder, ObjectiveComposer, SchedulingProblem, SolverKind, TieBreak,
};

const HORIZONS: &[usize] = &[12, 24, 48];

fn problem(len: usize) -> SchedulingProblem {
    let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let grid = TimeGrid::with_slots(start, Duration::hours(1), len).unwrap();
    let stock = StockModel {
        min: vec![-5.0; len],
        max: vec![5.0; len],
        eta_up: vec![0.95; len],
        eta_down: vec![0.95; len],
        retention: vec![0.999; len],
        mode: EfficiencyMode::Linear,
        ..StockModel::ideal(5.0, len)
    };
    let mut battery = Device::flexible(DeviceId::new("battery"), vec![-3.0; len], vec![3.0; len])
        .with_stock(stock);
    battery.prefer_charging_sooner = true;
    let load = Device::inflexible(
        DeviceId::new("load"),
        (0..len).map(|j| 1.0 + (j % 5) as f64 * 0.4).collect(),
    );

    let prices: Vec<f64> = (0..len)
        .map(|j| 0.2 + 0.1 * ((j as f64) * std::f64::consts::PI / 12.0).sin())
        .collect();
    let energy = Commitment::flow(
        "energy",
        vec![Some(0.0); len],
        prices.clone(),
        prices.iter().map(|p| -0.8 * p).collect(),
        Grouping::Each,
    );
    let peak = Commitment::flow(
        "consumption peak",
        vec![Some(3.0); len],
        vec![0.5; len],
        vec![0.0; len],
        Grouping::Any,
    );
    SchedulingProblem::new(grid, vec![battery, load], vec![energy, peak])
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_build");
    for &len in HORIZONS {
        let p = problem(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &p, |b, p| {
            b.iter(|| {
                let built = ConstraintBuilder::new(black_box(p)).build().unwrap();
                let objective =
                    ObjectiveComposer::new(p, &built.handles, TieBreak::default()).compose();
                built.buffer.into_program(objective.expression)
            })
        });
    }
    group.finish();
}

fn bench_solve(c: &mut Criterion) {
    let Ok(backend) = backend_for(SolverKind::Microlp) else {
        return;
    };
    let scheduler = Scheduler::new(backend, SchedulerSettings::default());
    let mut group = c.benchmark_group("build_and_solve");
    group.sample_size(10);
    for &len in HORIZONS {
        let p = problem(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &p, |b, p| {
            b.iter(|| scheduler.schedule_problem(black_box(p)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build, bench_solve);
criterion_main!(benches);
