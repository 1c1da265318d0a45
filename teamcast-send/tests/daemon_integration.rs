//! Integration tests for the teamcast-send binary

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use libteamcast::service::posts::CreatePostRequest;
use libteamcast::{Config, Content, Platform, PostStatus, TeamcastService};
use tempfile::TempDir;
use uuid::Uuid;

const BIN: &str = env!("CARGO_BIN_EXE_teamcast-send");

/// Config with a Twitter app and everything else under `dir`
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    let contents = format!(
        r#"
[database]
path = "{db}"

[vault]
keys_file = "{keys}"

[queue]
poll_interval_secs = 1

[twitter]
client_id = "client"
client_secret = "secret"
redirect_uri = "http://localhost/callback"
"#,
        db = dir.join("teamcast.db").display().to_string().replace('\\', "/"),
        keys = dir.join("vault-keys.toml").display().to_string().replace('\\', "/"),
    );
    fs::write(&path, contents).unwrap();
    path
}

fn run_once(config: &Path) -> Output {
    Command::new(BIN)
        .arg("--config")
        .arg(config)
        .arg("--once")
        .output()
        .unwrap()
}

async fn open(config: &Path) -> TeamcastService {
    TeamcastService::from_config(Config::load_from_path(config).unwrap())
        .await
        .unwrap()
}

/// A team with one post on Twitter but no connected account
async fn seed_post(service: &TeamcastService) -> (Uuid, Uuid) {
    let owner = Uuid::new_v4();
    let team = service.members().create_team(owner).await.unwrap();
    let post = service
        .posts()
        .create(CreatePostRequest {
            team_id: team.team_id,
            user_id: owner,
            content: Content::text("Launch day"),
            platforms: vec![Platform::Twitter],
        })
        .await
        .unwrap();
    (post.id, owner)
}

#[tokio::test]
async fn test_once_with_empty_queue_succeeds() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    let output = run_once(&config);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    // the vault key is created on first start
    assert!(temp_dir.path().join("vault-keys.toml").exists());
}

#[tokio::test]
async fn test_invalid_config_is_a_configuration_error() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("config.toml");
    fs::write(&config, "invalid toml content [[[").unwrap();

    let output = run_once(&config);
    assert_eq!(output.status.code(), Some(2));
}

#[tokio::test]
async fn test_no_platforms_is_a_configuration_error() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("config.toml");
    fs::write(
        &config,
        format!(
            "[database]\npath = \"{}\"\n",
            temp_dir.path().join("teamcast.db").display().to_string().replace('\\', "/")
        ),
    )
    .unwrap();

    let output = run_once(&config);
    assert_eq!(output.status.code(), Some(2));
}

#[tokio::test]
async fn test_config_from_environment() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    let status = Command::new(BIN)
        .env("TEAMCAST_CONFIG", &config)
        .arg("--once")
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_once_settles_due_post() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    let service = open(&config).await;
    let (post_id, owner) = seed_post(&service).await;
    service.posts().queue(post_id, owner).await.unwrap();
    drop(service);

    let output = run_once(&config);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let service = open(&config).await;
    let post = service.posts().get(post_id, owner).await.unwrap();
    assert_eq!(post.status(), PostStatus::Failed);
    let records = service.posts().records(post_id, owner).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("no connected twitter account"));
}

#[tokio::test]
async fn test_once_leaves_future_posts_alone() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    let service = open(&config).await;
    let (post_id, owner) = seed_post(&service).await;
    service
        .posts()
        .schedule(post_id, owner, chrono::Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    drop(service);

    let output = run_once(&config);
    assert!(output.status.success());

    let service = open(&config).await;
    let post = service.posts().get(post_id, owner).await.unwrap();
    assert_eq!(post.status(), PostStatus::Scheduled);
}

#[cfg(unix)]
#[test]
fn test_sigterm_stops_the_loop() {
    use std::io::{BufRead, BufReader};
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path());

    let mut child = Command::new(BIN)
        .arg("--config")
        .arg(&config)
        .env("TEAMCAST_LOG_LEVEL", "info")
        .env_remove("RUST_LOG")
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    // handlers are installed before the startup line is logged
    let stderr = child.stderr.take().unwrap();
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = lines.next().expect("daemon exited before starting").unwrap();
        if line.contains("teamcast-send starting") {
            break;
        }
    }

    let killed = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    // keep draining stderr so the child never blocks on a full pipe
    std::thread::spawn(move || lines.for_each(drop));

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "daemon did not stop after SIGTERM");
        std::thread::sleep(Duration::from_millis(100));
    };
    assert!(status.success());
}
