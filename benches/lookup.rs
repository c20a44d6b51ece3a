//! Hot-path lookups: domain hash index and membership bitmaps.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use urldex::index::{DomainMphf, MembershipIndex};

fn bench_domain_lookup(c: &mut Criterion) {
    let domains: Vec<String> = (0..100_000).map(|i| format!("site-{:06}.example", i)).collect();
    let index = DomainMphf::build(&domains);

    c.bench_function("mphf_lookup_hit", |b| {
        b.iter(|| index.lookup(black_box("site-054321.example")))
    });
    c.bench_function("mphf_lookup_miss", |b| {
        b.iter(|| index.lookup(black_box("absent.test")))
    });
}

fn bench_membership(c: &mut Criterion) {
    let mut membership = MembershipIndex::new(100_000);
    for i in 0..100_000u32 {
        membership.add(i, i % 7);
        if i % 3 == 0 {
            membership.add(i, 9);
        }
    }

    c.bench_function("datasets_for", |b| {
        b.iter(|| membership.datasets_for(black_box(54_321)))
    });
}

criterion_group!(benches, bench_domain_lookup, bench_membership);
criterion_main!(benches);
