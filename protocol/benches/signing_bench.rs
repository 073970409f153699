// Signing & receipt benchmarks for AutoRoute.
//
// Covers P-521 key generation, signing and verification of a single
// message, and building plus verifying a delivery receipt over batches of
// packet hashes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use autoroute::crypto::{sign, verify, PrivateKey};
use autoroute::merkle::make_receipt;
use autoroute::Packet;

fn bench_key_generation(c: &mut Criterion) {
    c.bench_function("p521/key_generate", |b| {
        b.iter(PrivateKey::generate);
    });
}

fn bench_sign_message(c: &mut Criterion) {
    let key = PrivateKey::generate();
    let message = b"receipt root for 128 packets; tick=42";

    c.bench_function("p521/sign_message", |b| {
        b.iter(|| sign(&key, message));
    });
}

fn bench_verify_signature(c: &mut Criterion) {
    let key = PrivateKey::generate();
    let signature = sign(&key, b"receipt root for 128 packets; tick=42");

    c.bench_function("p521/verify_signature", |b| {
        b.iter(|| verify(&signature));
    });
}

fn bench_receipts(c: &mut Criterion) {
    let key = PrivateKey::generate();
    let dest = key.address();
    let mut group = c.benchmark_group("receipt");

    for size in [1usize, 16, 128, 1024] {
        let hashes: Vec<_> = (0..size)
            .map(|i| Packet::new(dest, 1, format!("packet-{i}").into_bytes()).hash())
            .collect();
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("make", size), &hashes, |b, hashes| {
            b.iter(|| make_receipt(&key, hashes));
        });

        let receipt = make_receipt(&key, &hashes).expect("non-empty batch");
        group.bench_with_input(BenchmarkId::new("verify", size), &receipt, |b, receipt| {
            b.iter(|| receipt.verify());
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_key_generation,
    bench_sign_message,
    bench_verify_signature,
    bench_receipts,
);
criterion_main!(benches);
