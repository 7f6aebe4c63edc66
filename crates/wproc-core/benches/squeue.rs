//! Scheduling queue churn benchmark: the add/peek/remove pattern the
//! master runs once per dispatched job.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wproc_core::tv::now_secs;
use wproc_core::Squeue;

fn bench_add_remove(c: &mut Criterion) {
    c.bench_function("squeue_add_remove", |b| {
        let mut sq: Squeue<u32> = Squeue::new(4096);
        let now = now_secs();
        let mut i = 0u32;
        b.iter(|| {
            let h = sq.add(now + 1 + (i % 600) as i64, i);
            black_box(sq.peek());
            sq.remove(h);
            i = i.wrapping_add(1);
        })
    });
}

fn bench_pop_batch(c: &mut Criterion) {
    c.bench_function("squeue_pop_64", |b| {
        let now = now_secs();
        b.iter(|| {
            let mut sq: Squeue<u32> = Squeue::new(512);
            for i in 0..64u32 {
                sq.add(now + 1 + (i % 100) as i64, i);
            }
            while let Some(ev) = sq.pop() {
                black_box(ev);
            }
        })
    });
}

criterion_group!(benches, bench_add_remove, bench_pop_batch);
criterion_main!(benches);
