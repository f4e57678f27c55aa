use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use huddle::{
  identity::ConnectionId,
  rate_limit::{MessageLimits, RateLimiter},
};
use std::time::Duration;
use tokio::runtime::Runtime;

fn check_allowed_single_connection(c: &mut Criterion) {
  let mut group = c.benchmark_group("rate_limit_single_connection");
  let rt = Runtime::new().unwrap();
  let limiter = RateLimiter::new(MessageLimits::default());
  let conn = ConnectionId::from("conn1");

  group.bench_function("check_allowed_within_limit", |b| {
    b.to_async(&rt).iter(|| async {
      limiter.forget(&conn).await;
      for _ in 0..5 {
        black_box(limiter.check_allowed(&conn, 1024).await.is_ok());
      }
    });
  });

  group.finish();
}

fn check_allowed_many_connections(c: &mut Criterion) {
  let mut group = c.benchmark_group("rate_limit_many_connections");
  let rt = Runtime::new().unwrap();

  for num_conns in [10, 100, 1000] {
    group.bench_with_input(BenchmarkId::from_parameter(num_conns), &num_conns, |b, &num_conns| {
      let conns: Vec<ConnectionId> = (0..num_conns).map(|i| ConnectionId::from(format!("conn{}", i))).collect();
      b.to_async(&rt).iter(|| async {
        let limiter = RateLimiter::new(MessageLimits::default());
        for conn in &conns {
          black_box(limiter.check_allowed(conn, 256).await.is_ok());
        }
      });
    });
  }

  group.finish();
}

fn burst_until_throttled(c: &mut Criterion) {
  let mut group = c.benchmark_group("rate_limit_burst");
  let rt = Runtime::new().unwrap();

  group.bench_function("burst_of_50", |b| {
    b.to_async(&rt).iter(|| async {
      let limiter = RateLimiter::new(MessageLimits {
        max_messages_per_window: 30,
        window_duration: Duration::from_secs(1),
        ..MessageLimits::default()
      });
      let conn = ConnectionId::from("spammer");
      for _ in 0..50 {
        black_box(limiter.check_allowed(&conn, 64).await.is_err());
      }
    });
  });

  group.finish();
}

criterion_group!(
  benches,
  check_allowed_single_connection,
  check_allowed_many_connections,
  burst_until_throttled
);
criterion_main!(benches);
