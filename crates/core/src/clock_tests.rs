// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn system_clock_returns_increasing_time() {
    let clock = SystemClock;
    let t1 = clock.now();
    std::thread::sleep(Duration::from_millis(1));
    let t2 = clock.now();
    assert!(t2 > t1);
}

#[test]
fn fake_clock_can_be_advanced() {
    let clock = FakeClock::new();
    let t1 = clock.now();
    clock.advance(Duration::from_secs(60));
    let t2 = clock.now();
    assert!(t2.duration_since(t1) >= Duration::from_secs(60));
}

#[test]
fn fake_clock_is_cloneable_and_shared() {
    let clock1 = FakeClock::new();
    let clock2 = clock1.clone();
    clock2.advance(Duration::from_secs(30));
    assert_eq!(clock1.epoch_ms(), clock2.epoch_ms());
}

#[test]
fn fake_clock_epoch_tracks_advance() {
    let clock = FakeClock::new();
    clock.set_epoch_ms(5_000);
    clock.advance(Duration::from_millis(250));
    assert_eq!(clock.epoch_ms(), 5_250);
}

#[test]
fn start_stamp_formats_day_month_time() {
    // 2014-03-07 14:22:05 UTC
    assert_eq!(start_stamp(1_394_202_125_000), "07Mar14:22:05");
}

#[test]
fn start_stamp_has_no_underscore() {
    // The stamp follows the first underscore of the tag value, so the
    // owner prefix stays parseable whatever the stamp contains.
    let stamp = start_stamp(SystemClock.epoch_ms());
    assert!(!stamp.contains('_'), "stamp {stamp:?} would corrupt owner parsing");
}
