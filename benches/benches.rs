use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::prelude::*;
use rcb_slurper::{
    buffers::{BufferSet, StreamLayout},
    convert::SampleConverter,
    packet::{decode, PacketBuilder},
    sequence::SequenceTracker,
    solver::DeviceIntent,
};

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    let layout = StreamLayout::for_channels(32, true).unwrap();
    let mut builder = PacketBuilder::new(layout).sequence(1).aux(1, 0);
    for group in 0..layout.samples_per_packet {
        builder = builder.aux_sample(group, rng.gen());
        for ch in 0..layout.channel_count {
            builder = builder.electrode(group, ch, rng.gen());
        }
    }
    let dummy_payload = builder.build();

    // Containers
    let mut bufs = BufferSet::new(layout).unwrap();
    let mut converter = SampleConverter::new(layout, 20000.0);
    let mut tracker = SequenceTracker::new(layout.samples_per_packet);
    let packet = decode(&dummy_payload, layout).unwrap();

    c.bench_function("packet decode", |b| {
        b.iter(|| decode(black_box(&dummy_payload), black_box(layout)))
    });

    c.bench_function("sequence observe", |b| {
        let mut seq = 0u32;
        b.iter(|| {
            seq += 1;
            tracker.observe(black_box(seq))
        })
    });

    c.bench_function("sample convert", |b| {
        b.iter(|| {
            let block = converter.convert(black_box(&packet), black_box(0), &mut bufs.block);
            black_box(block.data[0]);
        })
    });

    c.bench_function("config solve", |b| {
        let intent = DeviceIntent::default();
        b.iter(|| black_box(&intent).solve())
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
