use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use forgebatch_core::JobParameters;
use forgebatch_infra::repository::{InMemoryExecutionStore, JobRepository, SimpleJobRepository};
use forgebatch_infra::step::{ChunkStep, ListItemWriter, PassThroughItemProcessor, VecItemReader};
use forgebatch_infra::SimpleJob;
use std::sync::Arc;

const ITEMS: u64 = 1_000;

fn repository() -> Arc<dyn JobRepository> {
    Arc::new(SimpleJobRepository::new(InMemoryExecutionStore::new()))
}

fn params() -> JobParameters {
    JobParameters::builder()
        .string("bench", "chunk")
        .build()
        .expect("valid parameters")
}

fn items() -> Vec<u64> {
    (0..ITEMS).collect()
}

fn bench_chunk_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_throughput");
    group.throughput(Throughput::Elements(ITEMS));

    for chunk_size in [1usize, 10, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let repo = repository();
                    let step = ChunkStep::builder("copy", repo.clone())
                        .reader(VecItemReader::new(items()))
                        .processor(PassThroughItemProcessor)
                        .writer(ListItemWriter::new())
                        .chunk_size(chunk_size)
                        .build()
                        .expect("complete step");
                    let mut job = SimpleJob::builder("bench", repo).step(step).build();
                    black_box(job.run(params()).expect("job runs"))
                });
            },
        );
    }
    group.finish();
}

fn bench_stateful_retry_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("stateful_retry_overhead");
    group.throughput(Throughput::Elements(ITEMS));

    group.bench_function("stateless", |b| {
        b.iter(|| {
            let repo = repository();
            let step = ChunkStep::builder("copy", repo.clone())
                .reader(VecItemReader::new(items()))
                .processor(PassThroughItemProcessor)
                .writer(ListItemWriter::new())
                .chunk_size(100)
                .retry_limit(3)
                .build()
                .expect("complete step");
            let mut job = SimpleJob::builder("bench", repo).step(step).build();
            black_box(job.run(params()).expect("job runs"))
        });
    });

    group.bench_function("stateful", |b| {
        b.iter(|| {
            let repo = repository();
            let step = ChunkStep::builder("copy", repo.clone())
                .reader(VecItemReader::new(items()))
                .processor(PassThroughItemProcessor)
                .writer(ListItemWriter::new())
                .chunk_size(100)
                .retry_limit(3)
                .retry_key(|item: &u64| item.to_string())
                .build()
                .expect("complete step");
            let mut job = SimpleJob::builder("bench", repo).step(step).build();
            black_box(job.run(params()).expect("job runs"))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_chunk_throughput, bench_stateful_retry_overhead);
criterion_main!(benches);
