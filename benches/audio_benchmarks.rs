use criterion::{black_box, criterion_group, criterion_main, Criterion};

use voice_session::audio::{
    apply_gain, decode_chunk, encode_chunk, mean_abs, PlaybackMixer, FRAME_SAMPLES,
};

fn test_frame() -> Vec<f32> {
    (0..FRAME_SAMPLES)
        .map(|i| ((i as f32) * 0.01).sin() * 0.5)
        .collect()
}

fn bench_encode_chunk(c: &mut Criterion) {
    let frame = test_frame();
    c.bench_function("encode_chunk_20ms", |b| {
        b.iter(|| {
            let _ = black_box(encode_chunk(black_box(&frame)));
        })
    });
}

fn bench_decode_chunk(c: &mut Criterion) {
    let encoded = encode_chunk(&test_frame());
    c.bench_function("decode_chunk_20ms", |b| {
        b.iter(|| {
            let _ = black_box(decode_chunk(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_apply_gain(c: &mut Criterion) {
    let frame = test_frame();
    c.bench_function("apply_gain_20ms", |b| {
        b.iter(|| {
            let mut work = frame.clone();
            apply_gain(black_box(&mut work), 0.8);
            black_box(work);
        })
    });
}

fn bench_mean_abs(c: &mut Criterion) {
    let frame = test_frame();
    c.bench_function("mean_abs_20ms", |b| {
        b.iter(|| {
            let _ = black_box(mean_abs(black_box(&frame)));
        })
    });
}

fn bench_mixer_fill_four_streams(c: &mut Criterion) {
    c.bench_function("mixer_fill_4_streams", |b| {
        b.iter_with_setup(
            || {
                let mixer = PlaybackMixer::new();
                for stream in ["a", "b", "c", "d"] {
                    mixer.submit(stream, test_frame());
                }
                mixer
            },
            |mixer| {
                let mut out = vec![0.0_f32; FRAME_SAMPLES];
                mixer.fill(black_box(&mut out));
                black_box(out);
            },
        )
    });
}

criterion_group!(
    benches,
    bench_encode_chunk,
    bench_decode_chunk,
    bench_apply_gain,
    bench_mean_abs,
    bench_mixer_fill_four_streams
);
criterion_main!(benches);
