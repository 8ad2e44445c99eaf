use chrono::{Duration, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use stride_ingest::models::{ActivityStreams, DailyContribution, DailyStat};

fn benchmark_aggregation(c: &mut Criterion) {
    let start = Utc.with_ymd_and_hms(2024, 3, 10, 5, 0, 0).unwrap();
    let now = Utc::now();

    // A busy day: many short efforts (e.g. track intervals uploaded separately)
    let contributions: Vec<DailyContribution> = (0..500)
        .map(|i| DailyContribution {
            user_id: 1,
            activity_id: i,
            stat_date: start.date_naive(),
            start_time: start + Duration::seconds(i * 30),
            distance: 400.0 + (i % 7) as f64,
            moving_time: 80 + i % 11,
            avg_pace: Some(200 + (i % 13) as i32),
            avg_hr: if i % 5 == 0 { None } else { Some(160) },
        })
        .collect();

    // Two hours of 1 Hz samples
    let samples: Vec<f64> = (0..7200).map(|i| 2.5 + (i % 40) as f64 * 0.05).collect();
    let streams = ActivityStreams::new(
        1,
        1,
        json!({
            "time": {"data": (0..7200).collect::<Vec<i64>>()},
            "velocity_smooth": {"data": samples}
        }),
        now,
    );

    let mut group = c.benchmark_group("aggregation");

    group.bench_function("replay_day_500_contributions", |b| {
        b.iter(|| DailyStat::replay(1, start.date_naive(), black_box(&contributions), now))
    });

    group.bench_function("incremental_apply_500", |b| {
        b.iter(|| {
            let mut stat = DailyStat::empty(1, start.date_naive(), now);
            for contribution in black_box(&contributions) {
                stat.apply(contribution, now);
            }
            stat
        })
    });

    group.bench_function("velocity_pace_7200_samples", |b| {
        b.iter(|| black_box(&streams).velocity_pace())
    });

    group.finish();
}

criterion_group!(benches, benchmark_aggregation);
criterion_main!(benches);
