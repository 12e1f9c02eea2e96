use std::sync::Arc;
use std::time::{Duration, Instant};

use pacer::{
    BurstConfig, BurstLevel, GroupKey, Pacer, PacerBuilder, PacerConfig, current_time_ms,
};

fn quiet_tuner_config() -> PacerConfig {
    // Keep the background tuner out of timing-sensitive tests.
    PacerConfig {
        tuner_cycle_ms: 3_600_000,
        ..Default::default()
    }
}

#[test]
fn test_exact_admission_count() {
    let pacer = Pacer::with_config(quiet_tuner_config());
    let key = GroupKey::from("scenario-1");

    // capacity 20, refill 4 per 50ms: 25 instant calls admit exactly 20.
    let admitted = (0..25).filter(|_| pacer.try_acquire(&key)).count();
    assert_eq!(admitted, 20);

    let stats = pacer.performance_stats();
    assert_eq!(stats.total_requests, 25);
    assert_eq!(stats.rejected_requests, 5);
    pacer.shutdown();
}

#[test]
fn test_refill_timing_accuracy() {
    let pacer = PacerBuilder::new()
        .base_capacity(10)
        .base_refill_interval_ms(100)
        .base_refill_tokens(10)
        .tuner_cycle_ms(3_600_000)
        .build();
    let key = GroupKey::from("refill");

    while pacer.try_acquire(&key) {}
    assert_eq!(pacer.bucket_snapshot(&key).unwrap().tokens, 0);

    // One whole refill period restores the full refill amount.
    std::thread::sleep(Duration::from_millis(120));
    let tokens = pacer.bucket_snapshot(&key).unwrap().tokens;
    assert!(tokens >= 9 && tokens <= 10, "tokens = {tokens}");
    pacer.shutdown();
}

#[test]
fn test_sustained_throughput_converges_to_refill_rate() {
    let pacer = Pacer::with_config(quiet_tuner_config());
    let key = GroupKey::from("sustained");

    let start = Instant::now();
    let mut admitted = 0usize;
    while start.elapsed() < Duration::from_millis(600) {
        if pacer.try_acquire(&key) {
            admitted += 1;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    // Initial burst of 20 plus 4 tokens per 50ms tick for the measured
    // duration, with a generous scheduling margin.
    let elapsed_ms = start.elapsed().as_millis() as usize;
    let expected = 20 + 4 * (elapsed_ms / 50);
    assert!(
        admitted >= expected / 2 && admitted <= expected + 12,
        "admitted = {admitted}, expected ≈ {expected}"
    );
    pacer.shutdown();
}

#[test]
fn test_wait_time_reflects_next_refill() {
    let pacer = Pacer::with_config(quiet_tuner_config());
    let key = GroupKey::from("wait");

    // A never-seen key has no wait at all.
    assert_eq!(pacer.wait_time(&key), Duration::ZERO);

    while pacer.try_acquire(&key) {}
    let wait = pacer.wait_time(&key);
    assert!(wait > Duration::ZERO);
    assert!(wait <= Duration::from_millis(50));

    // After waiting out the hint, a token is available again.
    std::thread::sleep(wait + Duration::from_millis(10));
    assert!(pacer.try_acquire(&key));
    pacer.shutdown();
}

#[test]
fn test_burst_escalation_to_extreme() {
    let pacer = Pacer::with_config(quiet_tuner_config());
    let key = GroupKey::from("storm");

    // 81 calls inside the 6s window cross all three thresholds (30/50/80).
    for _ in 0..81 {
        pacer.try_acquire(&key);
    }

    let snapshot = pacer.bucket_snapshot(&key).unwrap();
    assert_eq!(snapshot.burst_level, BurstLevel::Extreme);
    assert_eq!(snapshot.capacity, 100); // 20 × 5, at the legal ceiling
    assert!(snapshot.refill_interval_ms < 50);

    assert_eq!(pacer.performance_stats().burst_events, 3);
    pacer.shutdown();
}

#[test]
fn test_burst_deescalation_restores_baseline() {
    let pacer = PacerBuilder::new()
        .burst(BurstConfig {
            window_ms: 6_000,
            thresholds: [5, 10, 15],
            max_duration_ms: 200,
        })
        .tuner_cycle_ms(3_600_000)
        .build();
    let key = GroupKey::from("spike");

    for _ in 0..16 {
        pacer.try_acquire(&key);
    }
    assert_eq!(
        pacer.bucket_snapshot(&key).unwrap().burst_level,
        BurstLevel::Extreme
    );

    // Once the burst outlives its ceiling the baseline comes back.
    std::thread::sleep(Duration::from_millis(250));
    let snapshot = pacer.bucket_snapshot(&key).unwrap();
    assert_eq!(snapshot.burst_level, BurstLevel::None);
    assert_eq!(snapshot.capacity, 20);
    assert_eq!(snapshot.refill_interval_ms, 50);
    pacer.shutdown();
}

#[test]
fn test_idle_key_swept_and_recreated() {
    let pacer = PacerBuilder::new()
        .inactivity_ttl_ms(150)
        .tuner_cycle_ms(60)
        .build();
    // Sweep only; keep the recreated bucket at its exact baseline.
    pacer.set_adaptive_adjustment_enabled(false);
    let key = GroupKey::from("sleepy");

    while pacer.try_acquire(&key) {}
    assert!(pacer.bucket_snapshot(&key).is_some());

    // The background cycle sweeps the idle key...
    std::thread::sleep(Duration::from_millis(400));
    assert!(pacer.bucket_snapshot(&key).is_none());
    assert!(pacer.group_metrics(&key).is_none());

    // ...and the next call recreates fresh baseline state.
    assert!(pacer.try_acquire(&key));
    let snapshot = pacer.bucket_snapshot(&key).unwrap();
    assert_eq!(snapshot.capacity, 20);
    assert!(snapshot.tokens >= 19);
    pacer.shutdown();
}

#[test]
fn test_retry_delay_reference_values() {
    let pacer = Pacer::with_config(quiet_tuner_config());

    // retry 3, base 500ms, max 5s, multiplier 2.0 → 4000ms + jitter.
    for _ in 0..20 {
        let delay = pacer.retry_delay(3, Duration::from_millis(500), Duration::from_secs(5), 2.0);
        assert!(delay >= Duration::from_millis(4_000));
        assert!(delay <= Duration::from_millis(4_400));
    }

    // Every count lands inside [base/2, max].
    for count in 0..15 {
        let delay =
            pacer.retry_delay(count, Duration::from_millis(500), Duration::from_secs(5), 2.0);
        assert!(delay >= Duration::from_millis(250));
        assert!(delay <= Duration::from_secs(5));
    }
    pacer.shutdown();
}

#[test]
fn test_send_delay_always_inside_window() {
    let pacer = Pacer::with_config(quiet_tuner_config());

    for length in [0usize, 5, 50, 300, 800, 2_000, 50_000_000] {
        for is_media in [false, true] {
            let delay = pacer.send_delay(is_media, length);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(10_000));
        }
    }
    pacer.shutdown();
}

#[test]
fn test_tuner_expands_busy_group() {
    let pacer = PacerBuilder::new()
        .tuner_cycle_ms(80)
        .peak_hours(0, 24, 1.0, 1.0) // neutral time-of-day for determinism
        .build();
    let key = GroupKey::from("busy");

    // 25 requests in the trailing minute classify as high frequency (>20),
    // worth a 2.5× factor on the next cycle.
    for _ in 0..25 {
        pacer.try_acquire(&key);
    }
    assert!(pacer.group_metrics(&key).unwrap().frequency_per_minute > 20.0);

    std::thread::sleep(Duration::from_millis(250));

    let snapshot = pacer.bucket_snapshot(&key).unwrap();
    assert!(snapshot.capacity > 20, "capacity = {}", snapshot.capacity);
    assert!(snapshot.refill_tokens >= 4);
    pacer.shutdown();
}

#[test]
fn test_invariants_hold_under_concurrent_load() {
    let pacer = Arc::new(
        PacerBuilder::new()
            .tuner_cycle_ms(25)
            .build(),
    );
    let mut handles = vec![];

    for i in 0..8 {
        let pacer = pacer.clone();
        handles.push(std::thread::spawn(move || {
            let key = GroupKey::from(i as i64 % 4); // contend on 4 keys
            for _ in 0..200 {
                pacer.try_acquire(&key);
                let snapshot = pacer.bucket_snapshot(&key).unwrap();
                assert!(snapshot.tokens <= snapshot.capacity);
                assert!((2..=100).contains(&snapshot.capacity));
                assert!((30..=3_000).contains(&snapshot.refill_interval_ms));
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
    pacer.shutdown();
}

#[test]
fn test_report_and_health() {
    let pacer = Pacer::with_config(quiet_tuner_config());
    let key = GroupKey::from("report");

    for _ in 0..30 {
        pacer.try_acquire(&key);
    }
    pacer.send_delay(false, 100);
    pacer.metrics().record_enqueue();
    pacer.metrics().record_dequeue(25);
    pacer.metrics().record_send("text", current_time_ms());

    let report = pacer.generate_report();
    assert!(report.contains("Total Requests: 30"));
    assert!(report.contains("Success Rate"));
    assert!(report.contains("Average Wait"));
    assert!(report.contains("Burst Events"));
    assert!(report.contains("Active Groups: 1"));

    let health = pacer.health_score();
    assert!(health <= 100);
    pacer.shutdown();
}

#[test]
fn test_acquire_is_fast() {
    let pacer = Pacer::with_config(quiet_tuner_config());
    let key = GroupKey::from("latency");

    // Admissions and wait queries never block: 2000 mixed calls should be
    // far under a millisecond each even on a loaded CI box.
    let start = Instant::now();
    for _ in 0..1_000 {
        pacer.try_acquire(&key);
        pacer.wait_time(&key);
    }
    assert!(start.elapsed() < Duration::from_millis(500));
    pacer.shutdown();
}

#[test]
fn test_clear_all_and_reset_group() {
    let pacer = Pacer::with_config(quiet_tuner_config());

    for i in 0..5 {
        let key = GroupKey::from(i as i64);
        while pacer.try_acquire(&key) {}
    }
    assert_eq!(pacer.performance_stats().active_groups, 5);

    pacer.reset_group(&GroupKey::from(0_i64));
    assert!(pacer.try_acquire(&GroupKey::from(0_i64)));

    pacer.clear_all();
    // All buckets are gone; the next admission starts from a full bucket.
    assert!(pacer.try_acquire(&GroupKey::from(3_i64)));
    pacer.shutdown();
}
