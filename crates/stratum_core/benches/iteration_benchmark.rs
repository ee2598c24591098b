//! # Chunk Iteration Benchmark
//!
//! Measures linear column iteration through queries:
//! 1. Main-thread read of one column
//! 2. One job integrating velocity into position
//! 3. The same work split into per-archetype jobs with disjoint writes

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stratum_core::prelude::*;

const ENTITY_COUNT: usize = 1_000_000;

#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

impl Component for Position {}

#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Velocity {
    dx: f32,
    dy: f32,
    dz: f32,
}

impl Component for Velocity {}

#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Heat {
    kelvin: f32,
}

impl Component for Heat {}

fn populated() -> (World, ComponentTypeId, ComponentTypeId, ComponentTypeId) {
    let mut world = World::new(StoreConfig::default()).unwrap();
    let position = world.register::<Position>().unwrap();
    let velocity = world.register::<Velocity>().unwrap();
    let heat = world.register::<Heat>().unwrap();
    for i in 0..ENTITY_COUNT {
        let bundle = ComponentBundle::new()
            .with(position, Position::default())
            .with(velocity, Velocity { dx: 0.1, dy: 0.2, dz: 0.3 })
            .with(heat, Heat { kelvin: i as f32 });
        world.create_entity_with(&bundle).unwrap();
    }
    (world, position, velocity, heat)
}

fn integrate(scope: &mut AccessScope<'_>, query: QueryId) {
    for chunk in scope.chunks_mut(query, &ChunkFilter::all()).unwrap() {
        let velocities = chunk.column::<Velocity>().unwrap();
        let positions = chunk.column_mut::<Position>().unwrap();
        for (p, v) in positions.iter_mut().zip(velocities) {
            p.x += v.dx * 0.016;
            p.y += v.dy * 0.016;
            p.z += v.dz * 0.016;
        }
    }
}

// =============================================================================
// MAIN THREAD
// =============================================================================

fn bench_read_column(c: &mut Criterion) {
    let (mut world, position, _, _) = populated();
    let query = world.build_query(QueryDesc::new().with(position)).unwrap();

    c.bench_function("read_position_1M", |b| {
        b.iter(|| {
            let sum = world
                .access(|scope| {
                    let mut sum = 0.0f32;
                    for chunk in scope.chunks(query, &ChunkFilter::all()).unwrap() {
                        sum += chunk.column::<Position>().unwrap().iter().map(|p| p.x).sum::<f32>();
                    }
                    sum
                })
                .unwrap();
            black_box(sum)
        });
    });
}

// =============================================================================
// JOBS
// =============================================================================

fn bench_integrate_job(c: &mut Criterion) {
    let (world, position, velocity, heat) = populated();
    let moving = world.build_query(QueryDesc::new().with(position).with(velocity)).unwrap();
    let hot = world.build_query(QueryDesc::new().with(heat)).unwrap();

    c.bench_function("integrate_job_1M", |b| {
        b.iter(|| {
            let job = world.schedule(AccessSet::new().write(position).read(velocity), move |scope| {
                integrate(scope, moving);
            });
            world.complete(&job).unwrap();
        });
    });

    c.bench_function("integrate_and_cool_parallel_1M", |b| {
        b.iter(|| {
            let integrate_job = world.schedule(AccessSet::new().write(position).read(velocity), move |scope| {
                integrate(scope, moving);
            });
            let cool_job = world.schedule(AccessSet::new().write(heat), move |scope| {
                for chunk in scope.chunks_mut(hot, &ChunkFilter::all()).unwrap() {
                    for h in chunk.column_mut::<Heat>().unwrap() {
                        h.kelvin *= 0.99;
                    }
                }
            });
            world.complete(&integrate_job).unwrap();
            world.complete(&cool_job).unwrap();
        });
    });
}

criterion_group!(benches, bench_read_column, bench_integrate_job);
criterion_main!(benches);
