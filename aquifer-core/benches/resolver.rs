//! Resolver micro-benchmarks: producer churn at the root of a deep
//! scope chain, re-resolving a leaf consumer each time.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use aquifer_core::{Engine, Grip, Production, Tap, TapSpec};

struct FixedTap {
    spec: TapSpec,
    grip: Grip,
}

impl Tap for FixedTap {
    fn spec(&self) -> &TapSpec {
        &self.spec
    }

    fn produce(&self, production: &mut Production) {
        production.publish(self.grip.clone(), 7);
    }
}

fn bench_reresolution(c: &mut Criterion) {
    let engine = Engine::new();
    let root = engine.scope("root");
    let grip = Grip::new("bench", "out", 0);

    let mut scopes = vec![root];
    for depth in 0..64 {
        let child = scopes.last().unwrap().child(format!("depth-{depth}"));
        scopes.push(child);
    }
    let leaf = scopes.last().unwrap();
    let stream = leaf.stream(&grip);

    c.bench_function("attach_detach_deep_chain", |b| {
        b.iter(|| {
            let tap = Arc::new(FixedTap {
                spec: TapSpec::new(vec![grip.clone()]),
                grip: grip.clone(),
            });
            let handle = scopes[0].attach(tap).unwrap();
            engine.flush();
            drop(handle);
            engine.flush();
            stream.get()
        })
    });
}

criterion_group!(benches, bench_reresolution);
criterion_main!(benches);
