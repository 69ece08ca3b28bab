mod common;

use chrono::{DateTime, Duration, Utc};
use common::{days_ago, options, start, start_with, Harness};
use netstatsd::storage::{SeriesOwner, TrafficReport};
use netstatsd::{Network, NetworkInfo, StatsError};
use tokio_test::{assert_err, assert_ok};

/// Wi-Fi up on wlan0 with one day of 1000/200 and a second of 500/100.
async fn two_days_on_wifi(dir: &std::path::Path) -> Harness {
    let h = start(dir, vec![]).await;
    let wifi = Network::wifi();
    h.counters.set("wlan0", 0, 0);
    h.counters.set_time(days_ago(1) + Duration::hours(8));
    h.handle.network_changed(NetworkInfo::wifi("wlan0"));
    assert_ok!(h.handle.update_stats(&wifi).await);

    h.counters.set("wlan0", 1000, 200);
    assert_ok!(h.handle.update_stats(&wifi).await);

    h.counters.set_time(days_ago(0) + Duration::hours(1));
    h.counters.set("wlan0", 1500, 300);
    assert_ok!(h.handle.update_stats(&wifi).await);
    h
}

#[tokio::test]
async fn counter_reads_become_daily_samples() {
    let tmp = tempfile::tempdir().unwrap();
    let h = two_days_on_wifi(tmp.path()).await;
    let wifi = Network::wifi();

    let stats = h.handle.current_stats(&wifi, None).await.unwrap();
    assert_eq!((stats.rx_bytes, stats.tx_bytes), (1500, 300));

    let set = h.handle.get_samples(&wifi, days_ago(1), days_ago(0), SeriesOwner::System).await.unwrap();
    assert_eq!(set.data.len(), 2);
    assert_eq!((set.data[0].rx_bytes, set.data[0].tx_bytes), (Some(1000), Some(200)));
    assert_eq!((set.data[1].rx_bytes, set.data[1].tx_bytes), (Some(500), Some(100)));

    let today = h.handle.current_stats(&wifi, Some(days_ago(0))).await.unwrap();
    assert_eq!((today.rx_bytes, today.tx_bytes), (500, 100));
    assert_eq!(h.handle.available_networks().await.unwrap(), vec![wifi]);
}

#[tokio::test]
async fn concurrent_refreshes_share_one_counter_read() {
    let tmp = tempfile::tempdir().unwrap();
    let h = two_days_on_wifi(tmp.path()).await;
    let wifi = Network::wifi();
    let reads = h.counters.reads();

    h.counters.set("wlan0", 1600, 300);
    let (a, b, c) = tokio::join!(
        h.handle.update_stats(&wifi),
        h.handle.update_stats(&wifi),
        h.handle.update_stats(&wifi),
    );
    assert_ok!(a);
    assert_ok!(b);
    assert_ok!(c);
    assert_eq!(h.counters.reads(), reads + 1);
    assert_eq!(h.handle.current_stats(&wifi, None).await.unwrap().rx_bytes, 1600);
}

#[tokio::test]
async fn counter_failure_reaches_every_waiter() {
    let tmp = tempfile::tempdir().unwrap();
    let h = two_days_on_wifi(tmp.path()).await;
    let wifi = Network::wifi();

    h.counters.set_failing(true);
    let (a, b) = tokio::join!(h.handle.update_stats(&wifi), h.handle.update_stats(&wifi));
    assert!(matches!(a, Err(StatsError::CounterSource(_))));
    assert!(matches!(b, Err(StatsError::CounterSource(_))));

    // Nothing was lost: the next good read still sees the whole delta.
    h.counters.set_failing(false);
    h.counters.set("wlan0", 1700, 300);
    assert_ok!(h.handle.update_stats(&wifi).await);
    assert_eq!(h.handle.current_stats(&wifi, None).await.unwrap().rx_bytes, 1700);
}

#[tokio::test]
async fn app_reports_are_cached_until_flushed() {
    let tmp = tempfile::tempdir().unwrap();
    let h = two_days_on_wifi(tmp.path()).await;
    let wifi = Network::wifi();
    let app = "app://music.localhost/manifest.webmanifest";

    assert_ok!(h.handle.report_traffic(app, "", &wifi, 10, 5, false));
    assert_ok!(h.handle.report_traffic(app, "", &wifi, 20, 5, false));
    assert_ok!(h.handle.report_traffic("", "ota", &wifi, 7, 1, false));
    assert_ok!(h.handle.flush_cache().await);

    let now = Utc::now();
    let set = h.handle.get_samples(&wifi, now, now, SeriesOwner::App(app.into())).await.unwrap();
    assert_eq!(set.data.len(), 1);
    assert_eq!((set.data[0].rx_bytes, set.data[0].tx_bytes), (Some(30), Some(10)));
    assert_eq!(h.handle.available_service_types().await.unwrap(), vec!["ota".to_string()]);

    // App traffic never leaks into the whole-device series.
    assert_eq!(h.handle.current_stats(&wifi, None).await.unwrap().rx_bytes, 1500);
}

#[tokio::test]
async fn report_needs_exactly_one_owner() {
    let tmp = tempfile::tempdir().unwrap();
    let h = start(tmp.path(), vec![]).await;
    let wifi = Network::wifi();

    assert!(matches!(h.handle.report_traffic("", "", &wifi, 1, 1, false), Err(StatsError::InvalidSeries(_))));
    assert!(matches!(h.handle.report_traffic("app://a", "mms", &wifi, 1, 1, false), Err(StatsError::InvalidSeries(_))));

    // Unknown networks are dropped quietly.
    let sim = Network::mobile("8934");
    assert_ok!(h.handle.report_traffic("", "mms", &sim, 1, 1, false));
    assert_ok!(h.handle.flush_cache().await);
    assert!(h.handle.available_service_types().await.unwrap().is_empty());
}

#[tokio::test]
async fn clear_restarts_counting_from_current_counters() {
    let tmp = tempfile::tempdir().unwrap();
    let h = two_days_on_wifi(tmp.path()).await;
    let wifi = Network::wifi();

    assert_ok!(h.handle.clear_stats(&wifi).await);
    let stats = h.handle.current_stats(&wifi, None).await.unwrap();
    assert_eq!((stats.rx_bytes, stats.tx_bytes), (0, 0));

    h.counters.set("wlan0", 1600, 350);
    assert_ok!(h.handle.update_stats(&wifi).await);
    let stats = h.handle.current_stats(&wifi, None).await.unwrap();
    assert_eq!((stats.rx_bytes, stats.tx_bytes), (100, 50));

    assert_ok!(h.handle.clear_all_stats().await);
    assert_eq!(h.handle.current_stats(&wifi, None).await.unwrap().rx_total_bytes, 0);
}

#[tokio::test]
async fn networks_are_validated() {
    let tmp = tempfile::tempdir().unwrap();
    let sim = "8934071100276980483".to_string();
    let h = start(tmp.path(), vec![sim.clone()]).await;

    let unknown = Network::mobile("1111");
    let err = h.handle.get_samples(&unknown, days_ago(1), days_ago(0), SeriesOwner::System).await;
    assert_eq!(err, Err(StatsError::InvalidNetwork(unknown.to_string())));
    assert_err!(h.handle.clear_stats(&unknown).await);

    // A SIM that is present but not connected is valid with no data.
    let set = h.handle.get_samples(&Network::mobile(&sim), days_ago(1), days_ago(0), SeriesOwner::System).await.unwrap();
    assert!(set.data.iter().all(|p| p.rx_bytes.is_none()));
    assert_eq!(h.handle.available_networks().await.unwrap(), vec![Network::mobile(&sim)]);
}

#[tokio::test]
async fn unmetered_mobile_is_not_accounted() {
    let tmp = tempfile::tempdir().unwrap();
    let h = start(tmp.path(), vec![]).await;
    h.counters.set("rmnet0", 500, 500);

    let mut info = NetworkInfo::mobile("rmnet0", "8934");
    info.metered = false;
    h.handle.network_changed(info);
    assert_ok!(h.handle.update_all_stats().await);
    assert!(h.handle.available_networks().await.unwrap().is_empty());
}

#[tokio::test]
async fn removed_interface_is_booked_one_last_time() {
    let tmp = tempfile::tempdir().unwrap();
    let h = two_days_on_wifi(tmp.path()).await;
    let wifi = Network::wifi();

    h.counters.set("wlan0", 1800, 400);
    assert_ok!(h.handle.network_removed("wlan0").await);
    // Further counter movement no longer reaches the network.
    h.counters.set("wlan0", 9999, 9999);
    assert_ok!(h.handle.update_stats(&wifi).await);

    let stats = h.handle.current_stats(&wifi, None).await.unwrap();
    assert_eq!((stats.rx_bytes, stats.tx_bytes), (1800, 400));
}

#[tokio::test]
async fn history_outlives_the_service() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let h = two_days_on_wifi(tmp.path()).await;
        h.counters.set("wlan0", 1550, 300);
        assert_ok!(h.handle.shutdown().await);
        assert_eq!(h.handle.flush_cache().await, Err(StatsError::ServiceStopped));
    }

    let h = start(tmp.path(), vec![]).await;
    let wifi = Network::wifi();
    // Wi-Fi is not connected: the network is known only from its history.
    let stats = h.handle.current_stats(&wifi, None).await.unwrap();
    assert_eq!(stats.rx_bytes, 1550);
    assert_ok!(h.handle.get_samples(&wifi, days_ago(1), days_ago(0), SeriesOwner::System).await);
}

fn app_report(app: &str, date: DateTime<Utc>, rx: u64) -> TrafficReport {
    TrafficReport::system(Network::wifi(), date, rx, 1).with_owner(SeriesOwner::App(app.into()))
}

#[tokio::test]
async fn clock_change_writes_out_cached_reports() {
    let tmp = tempfile::tempdir().unwrap();
    let h = start(tmp.path(), vec![]).await;
    let wifi = Network::wifi();
    let app = "app://news.localhost/manifest.webmanifest";

    assert_ok!(h.handle.report_traffic(app, "", &wifi, 40, 4, false));
    h.handle.time_changed();
    // Queued behind the flush the clock change asked for.
    assert_ok!(h.handle.update_stats(&wifi).await);

    let now = Utc::now();
    let set = h.handle.get_samples(&wifi, now, now, SeriesOwner::App(app.into())).await.unwrap();
    assert_eq!((set.data[0].rx_bytes, set.data[0].tx_bytes), (Some(40), Some(4)));
}

#[tokio::test(start_paused = true)]
async fn day_boundary_books_into_the_day_that_ended() {
    let tmp = tempfile::tempdir().unwrap();
    let h = start(tmp.path(), vec![]).await;
    let wifi = Network::wifi();
    h.counters.set("wlan0", 0, 0);
    h.handle.network_changed(NetworkInfo::wifi("wlan0"));
    assert_ok!(h.handle.update_stats(&wifi).await);

    // Readings arrive stamped with the new day, the traffic belongs to the old one.
    h.counters.set("wlan0", 700, 70);
    h.counters.set_time(days_ago(-1) + Duration::hours(1));
    tokio::time::sleep(std::time::Duration::from_secs(25 * 3600)).await;

    let set = h.handle.get_samples(&wifi, days_ago(0), days_ago(-1), SeriesOwner::System).await.unwrap();
    assert_eq!((set.data[0].rx_bytes, set.data[0].tx_bytes), (Some(700), Some(70)));
    assert_eq!(h.handle.current_stats(&wifi, Some(days_ago(-1))).await.unwrap().rx_bytes, 0);
}

#[tokio::test]
async fn new_day_report_writes_out_the_previous_day() {
    let tmp = tempfile::tempdir().unwrap();
    let h = start(tmp.path(), vec![]).await;
    let wifi = Network::wifi();
    let app = "app://maps.localhost/manifest.webmanifest";
    let owner = SeriesOwner::App(app.into());

    assert_ok!(h.handle.submit_report(app_report(app, days_ago(1) + Duration::hours(20), 10)));
    assert_ok!(h.handle.submit_report(app_report(app, days_ago(0) + Duration::hours(1), 20)));
    assert_ok!(h.handle.update_stats(&wifi).await);

    let set = h.handle.get_samples(&wifi, days_ago(1), days_ago(0), owner.clone()).await.unwrap();
    assert_eq!(set.data[0].rx_bytes, Some(10));
    assert_eq!(set.data[1].rx_bytes, None);

    assert_ok!(h.handle.flush_cache().await);
    let set = h.handle.get_samples(&wifi, days_ago(1), days_ago(0), owner).await.unwrap();
    assert_eq!(set.data[1].rx_bytes, Some(20));
}

#[tokio::test]
async fn oversized_cache_entry_is_written_at_once() {
    let tmp = tempfile::tempdir().unwrap();
    let mut opts = options(tmp.path());
    opts.max_cached_traffic = 100;
    let h = start_with(opts, vec![]).await;
    let wifi = Network::wifi();
    let video = "app://video.localhost/manifest.webmanifest";
    let mail = "app://mail.localhost/manifest.webmanifest";

    assert_ok!(h.handle.report_traffic(video, "", &wifi, 60, 0, false));
    assert_ok!(h.handle.report_traffic(video, "", &wifi, 50, 0, false));
    assert_ok!(h.handle.report_traffic(mail, "", &wifi, 30, 0, false));
    assert_ok!(h.handle.update_stats(&wifi).await);

    let now = Utc::now();
    let set = h.handle.get_samples(&wifi, now, now, SeriesOwner::App(video.into())).await.unwrap();
    assert_eq!(set.data[0].rx_bytes, Some(110));
    let set = h.handle.get_samples(&wifi, now, now, SeriesOwner::App(mail.into())).await.unwrap();
    assert_eq!(set.data[0].rx_bytes, None);
}

#[tokio::test]
async fn report_survives_a_failed_new_day_flush() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("data");
    let h = start(&dir, vec![]).await;
    let wifi = Network::wifi();
    let (old, new) = ("app://old.localhost/manifest.webmanifest", "app://new.localhost/manifest.webmanifest");

    assert_ok!(h.handle.submit_report(app_report(old, days_ago(1) + Duration::hours(20), 10)));
    assert_ok!(h.handle.update_stats(&wifi).await);

    std::fs::remove_dir_all(&dir).unwrap();
    assert_ok!(h.handle.submit_report(app_report(new, days_ago(0) + Duration::hours(1), 20)));
    assert_ok!(h.handle.update_stats(&wifi).await);

    std::fs::create_dir_all(&dir).unwrap();
    assert_ok!(h.handle.flush_cache().await);
    let set = h.handle.get_samples(&wifi, days_ago(1), days_ago(1), SeriesOwner::App(old.into())).await.unwrap();
    assert_eq!(set.data[0].rx_bytes, Some(10));
    let set = h.handle.get_samples(&wifi, days_ago(0), days_ago(0), SeriesOwner::App(new.into())).await.unwrap();
    assert_eq!(set.data[0].rx_bytes, Some(20));
}
