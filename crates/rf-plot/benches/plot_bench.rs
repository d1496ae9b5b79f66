//! Plot navigation and property lookup benchmarks

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rf_plot::{Callback, GamePlot, Navigation, Position, PropertyMask, StageDef, Stager, Step};

fn build_plot(stages: usize) -> GamePlot {
    let mut stager = Stager::with_seed(11);
    for i in 0..stages {
        let id = format!("stage{}", i);
        let steps = (0..4).map(|s| {
            Step::new(format!("{}_step{}", id, s), Callback::noop()).with_property("timer", s * 10)
        });
        stager
            .add_stage(StageDef::new(id.clone()).steps(steps).with_property("points", i))
            .unwrap();
        if i % 3 == 0 {
            stager.repeat(id.as_str(), 3).unwrap();
        } else {
            stager.next_at(id.as_str(), "*").unwrap();
        }
    }
    stager.gameover().unwrap();
    GamePlot::new(stager).unwrap()
}

fn bench_walk(c: &mut Criterion) {
    let mut plot = build_plot(32);

    c.bench_function("plot_walk_32_stages", |b| {
        b.iter(|| {
            let mut current = Position::start();
            while let Navigation::At(next) = plot.next(black_box(&current)) {
                current = next;
            }
            current
        })
    });
}

fn bench_finalize(c: &mut Criterion) {
    c.bench_function("stager_finalize_32_stages", |b| {
        b.iter(|| black_box(build_plot(32)))
    });
}

fn bench_property(c: &mut Criterion) {
    let mut plot = build_plot(8);
    let pos: Position = "4.2.1".parse().unwrap();

    c.bench_function("get_property_cached", |b| {
        b.iter(|| plot.get_property(black_box(&pos), "points"))
    });

    let uncached = PropertyMask {
        cache: true,
        ..Default::default()
    };
    c.bench_function("get_property_uncached", |b| {
        b.iter(|| plot.get_property_masked(black_box(&pos), "points", uncached))
    });
}

criterion_group!(benches, bench_walk, bench_finalize, bench_property);
criterion_main!(benches);
