use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowacct::channel::handlers::HandlerChain;
use flowacct::channel::{DecodedFlow, SamplingEvaluator, TagFilter};
use flowacct_common::Aggregation;

fn bench_handlers(c: &mut Criterion) {
    let flow = DecodedFlow::from_json(
        r#"{"src_ip":"10.0.0.1","dst_ip":"10.0.0.2","src_port":40000,"dst_port":443,"proto":6,"bytes":1500}"#,
    )
    .unwrap_or_default();
    let chain = HandlerChain::for_aggregation(
        Aggregation::parse("src_host,dst_host,src_port,dst_port,proto").unwrap_or_default(),
    );
    c.bench_function("handler_chain_build", |b| b.iter(|| chain.build(black_box(&flow))));
}

fn bench_sampling(c: &mut Criterion) {
    let mut sampling = SamplingEvaluator::with_seed(100, 42);
    c.bench_function("sampling_accept", |b| b.iter(|| black_box(sampling.accept())));
}

fn bench_tag_filter(c: &mut Criterion) {
    let filter = TagFilter::new([7, 9, 11, 13, 17, 19, 23, 29]);
    c.bench_function("tag_filter_accepts", |b| {
        b.iter(|| black_box(filter.accepts(black_box(23))))
    });
}

criterion_group!(benches, bench_handlers, bench_sampling, bench_tag_filter);
criterion_main!(benches);
