use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use http::Request;
use interpose::chunked::ChunkedWriter;
use interpose::condition::{host_is, url_is};
use interpose::http::empty_body;
use interpose::{Proxy, ProxyContext};
use tokio::runtime::Runtime;

fn proxy_with_handlers(n: usize) -> Proxy {
    let mut builder = Proxy::builder();
    for i in 0..n {
        // none match, so every request walks the whole chain
        builder = builder
            .on_request([host_is([format!("h{i}.test")]), url_is(["/never"])])
            .do_fn(|req, _ctx| (req, None));
    }
    builder
        .on_response([])
        .do_fn(|resp, _ctx| resp)
        .build()
}

fn pipeline_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = "127.0.0.1:9".parse().unwrap();

    let mut group = c.benchmark_group("filter_request");
    group.measurement_time(Duration::from_secs(5));
    for n in [1, 8, 64] {
        let proxy = proxy_with_handlers(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &proxy, |b, proxy| {
            b.to_async(&rt).iter(|| {
                let proxy = proxy.clone();
                async move {
                    let mut ctx = ProxyContext::new(proxy.clone(), client);
                    let req = Request::get("http://good.test/y").body(empty_body()).unwrap();
                    let (req, resp) = proxy.pipeline().filter_request(req, &mut ctx).await;
                    assert!(resp.is_none());
                    req
                }
            });
        });
    }
    group.finish();

    let mut group = c.benchmark_group("chunked_writer");
    for size in [64usize, 4096, 65536] {
        let data = vec![b'x'; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.to_async(&rt).iter(|| async move {
                let mut w = ChunkedWriter::new(tokio::io::sink());
                for _ in 0..16 {
                    w.write_chunk(data).await.unwrap();
                }
                w.finish().await.unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, pipeline_benchmarks);
criterion_main!(benches);
