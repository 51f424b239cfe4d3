//! Microbenchmarks for the datapath building blocks: packet header
//! encode/decode and slab allocation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use fabrpc::alloc::HugeAllocator;
use fabrpc::packet::{pkts_for, PktHdr, PktType};

fn bench_pkt_hdr(c: &mut Criterion) {
    let hdr = PktHdr::new(7, 0x123456, 42, PktType::Req, 3, 0x0ABC_DEF0_1234);
    let bytes = hdr.to_bytes();

    c.bench_function("pkt_hdr_encode", |b| {
        b.iter(|| black_box(black_box(&hdr).to_bytes()))
    });
    c.bench_function("pkt_hdr_decode", |b| {
        b.iter(|| black_box(PktHdr::from_bytes(black_box(&bytes)).unwrap()))
    });
    c.bench_function("pkts_for", |b| {
        b.iter(|| black_box(pkts_for(black_box(1_000_000), 1024)))
    });
}

fn bench_alloc(c: &mut Criterion) {
    let mut alloc = HugeAllocator::new(64 * 1024 * 1024);

    c.bench_function("slab_alloc_free_4k", |b| {
        b.iter(|| {
            let buf = alloc.alloc(black_box(4096)).unwrap();
            alloc.free(buf);
        })
    });
    c.bench_function("slab_alloc_free_1m", |b| {
        b.iter(|| {
            let buf = alloc.alloc(black_box(1024 * 1024)).unwrap();
            alloc.free(buf);
        })
    });
}

criterion_group!(benches, bench_pkt_hdr, bench_alloc);
criterion_main!(benches);
