use chrono::{Duration, TimeZone, Utc};
use hypewatch::database;
use hypewatch::database::models::HypeEventRecord;
use hypewatch::database::repositories::{HypeEventRepository, SqlxHypeEventRepository};
use hypewatch::pipeline::HypeEvent;
use hypewatch::Error;
use tempfile::TempDir;

async fn repository(dir: &TempDir) -> SqlxHypeEventRepository {
    let db_path = dir.path().join("hype.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = database::init_pool(&db_url).await.unwrap();
    database::run_migrations(&pool).await.unwrap();
    SqlxHypeEventRepository::new(pool)
}

fn event(channel: &str, minute: u32, velocity: f64) -> HypeEvent {
    HypeEvent {
        channel: channel.to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
        velocity,
        baseline_mean: 5.0,
        baseline_std: 1.5,
        multiplier: velocity / 5.0,
        top_emotes: vec![("KEKW".to_string(), 7), ("LUL".to_string(), 3)],
    }
}

#[tokio::test]
async fn create_and_fetch_round_trips_event() {
    let dir = TempDir::new().unwrap();
    let repo = repository(&dir).await;

    let stored = event("foo", 0, 25.0);
    let id = repo.create(&stored).await.unwrap();
    assert!(id > 0);

    let record = HypeEventRecord::from(repo.get_by_id(id).await.unwrap());
    assert_eq!(record.id, id);
    assert_eq!(record.channel, "foo");
    assert_eq!(record.timestamp, stored.timestamp);
    assert_eq!(record.velocity, 25.0);
    assert_eq!(record.top_emotes, stored.top_emotes);
}

#[tokio::test]
async fn missing_event_is_not_found() {
    let dir = TempDir::new().unwrap();
    let repo = repository(&dir).await;

    let err = repo.get_by_id(42).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn empty_top_emotes_read_back_as_empty() {
    let dir = TempDir::new().unwrap();
    let repo = repository(&dir).await;

    let mut quiet = event("foo", 0, 10.0);
    quiet.top_emotes.clear();
    let id = repo.create(&quiet).await.unwrap();

    let model = repo.get_by_id(id).await.unwrap();
    assert!(model.top_emotes_json.is_none());
    assert!(HypeEventRecord::from(model).top_emotes.is_empty());
}

#[tokio::test]
async fn list_is_newest_first_with_channel_filter_and_paging() {
    let dir = TempDir::new().unwrap();
    let repo = repository(&dir).await;

    repo.create(&event("foo", 1, 10.0)).await.unwrap();
    repo.create(&event("bar", 2, 20.0)).await.unwrap();
    repo.create(&event("foo", 3, 30.0)).await.unwrap();

    let all = repo.list(None, 10, 0).await.unwrap();
    let velocities: Vec<f64> = all.iter().map(|e| e.velocity).collect();
    assert_eq!(velocities, vec![30.0, 20.0, 10.0]);
    assert_eq!(repo.count(None).await.unwrap(), 3);

    let foo = repo.list(Some("foo"), 10, 0).await.unwrap();
    assert_eq!(foo.len(), 2);
    assert_eq!(repo.count(Some("foo")).await.unwrap(), 2);

    let page = repo.list(None, 1, 1).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].channel, "bar");
}

#[tokio::test]
async fn list_since_bounds_the_lookback() {
    let dir = TempDir::new().unwrap();
    let repo = repository(&dir).await;

    let now = Utc::now();
    let mut old = event("foo", 0, 10.0);
    old.timestamp = now - Duration::hours(30);
    let mut fresh = event("foo", 0, 20.0);
    fresh.timestamp = now - Duration::hours(1);
    let mut other = event("bar", 0, 30.0);
    other.timestamp = now - Duration::minutes(5);

    repo.create(&old).await.unwrap();
    repo.create(&fresh).await.unwrap();
    repo.create(&other).await.unwrap();

    let since = now - Duration::hours(24);
    assert_eq!(repo.list_since(None, since).await.unwrap().len(), 2);

    let foo = repo.list_since(Some("foo"), since).await.unwrap();
    assert_eq!(foo.len(), 1);
    assert_eq!(foo[0].velocity, 20.0);
}

#[tokio::test]
async fn export_csv_has_header_and_rows() {
    let dir = TempDir::new().unwrap();
    let repo = repository(&dir).await;

    let empty = repo.export_csv(None).await.unwrap();
    assert_eq!(
        empty,
        "channel,timestamp,velocity,baseline_mean,baseline_std,multiplier"
    );

    repo.create(&event("foo", 0, 25.0)).await.unwrap();
    repo.create(&event("bar", 1, 40.0)).await.unwrap();

    let csv = repo.export_csv(Some("foo")).await.unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1], "foo,2024-05-01T12:00:00.000Z,25.0,5.0,1.5,5.00");
}
