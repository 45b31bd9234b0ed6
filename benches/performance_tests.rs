use criterion::{black_box, criterion_group, criterion_main, Criterion};
use note_vault::crypto::Blake3Hasher;
use note_vault::vault::chunker::chunk_text;

fn sample_note(paragraphs: usize) -> String {
    (0..paragraphs)
        .map(|i| format!("## Section {}\n\nSome notes about topic {} with a few more words to fill the line.", i, i))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn bench_chunking(c: &mut Criterion) {
    let small = sample_note(5);
    let large = sample_note(2_000);
    c.bench_function("chunk_small_note", |b| b.iter(|| chunk_text(black_box(&small), 1000)));
    c.bench_function("chunk_large_note", |b| b.iter(|| chunk_text(black_box(&large), 1000)));
}

fn bench_hashing(c: &mut Criterion) {
    let content = "a".repeat(1 << 20);
    c.bench_function("hash_1mb", |b| b.iter(|| Blake3Hasher::hash_content(black_box(content.as_bytes()))));
}

criterion_group!(benches, bench_chunking, bench_hashing);
criterion_main!(benches);
