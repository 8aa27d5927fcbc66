use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn no_env(_: &str) -> Option<String> {
    None
}

fn temp_settings_file(contents: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("inbox_settings_test_{suffix}.toml"));
    fs::write(&path, contents).expect("write settings");
    path
}

#[test]
fn derives_ws_url_from_http_base() {
    let settings = ClientSettings {
        base_url: "http://127.0.0.1:9000".into(),
        ..ClientSettings::default()
    };
    assert_eq!(settings.ws_url().expect("ws url").as_str(), "ws://127.0.0.1:9000/ws");
}

#[test]
fn derives_wss_url_and_keeps_base_path() {
    let settings = ClientSettings {
        base_url: "https://campus.example.edu/api/".into(),
        ..ClientSettings::default()
    };
    assert_eq!(
        settings.ws_url().expect("ws url").as_str(),
        "wss://campus.example.edu/api/ws"
    );
    assert_eq!(
        settings.conversations_url().expect("rest url"),
        "https://campus.example.edu/api/chat/conversations"
    );
}

#[test]
fn rejects_non_http_base_url() {
    for base_url in ["ftp://example.edu", "not a url", "ws://example.edu"] {
        let settings = ClientSettings {
            base_url: base_url.into(),
            ..ClientSettings::default()
        };
        assert!(
            matches!(settings.ws_url(), Err(SettingsError::InvalidBaseUrl(_))),
            "{base_url} should be rejected"
        );
    }
}

#[test]
fn broker_endpoint_carries_host_and_timing() {
    let settings = ClientSettings {
        base_url: "https://chat.example.edu".into(),
        heartbeat_ms: 0,
        connect_timeout_ms: 2_500,
        ..ClientSettings::default()
    };
    let endpoint = settings.broker_endpoint().expect("endpoint");
    assert_eq!(endpoint.host, "chat.example.edu");
    assert_eq!(endpoint.heartbeat, Duration::ZERO);
    assert_eq!(endpoint.connect_timeout, Duration::from_millis(2_500));
}

#[test]
fn file_values_are_overridden_by_env() {
    let path = temp_settings_file(
        "base_url = \"https://file.example.edu\"\nreconnect_interval_ms = 5000\npage_size = 7\n",
    );
    let env_values = HashMap::from([
        ("APP__RECONNECT_INTERVAL_MS", "1500".to_string()),
        ("APP__BASE_URL", "http://env.example.edu".to_string()),
    ]);

    let settings =
        load_settings_from(Some(&path), |key| env_values.get(key).cloned()).expect("load");
    assert_eq!(settings.base_url, "http://env.example.edu");
    assert_eq!(settings.reconnect_interval_ms, 1_500);
    assert_eq!(settings.page_size, 7);
    assert_eq!(settings.ws_path, "/ws");

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn reports_unparsable_env_numbers() {
    let err = load_settings_from(Some(&temp_settings_file("")), |key| {
        (key == "APP__HEARTBEAT_MS").then(|| "soon".to_string())
    })
    .expect_err("must fail");
    assert!(matches!(
        err,
        SettingsError::InvalidValue {
            key: "APP__HEARTBEAT_MS",
            ..
        }
    ));
}

#[test]
fn reports_malformed_file() {
    let path = temp_settings_file("reconnect_interval_ms = \"often\"");
    let err = load_settings_from(Some(&path), no_env).expect_err("must fail");
    assert!(matches!(err, SettingsError::Parse { .. }));
    fs::remove_file(path).expect("cleanup");
}

#[test]
fn missing_explicit_file_is_an_error() {
    let path = env::temp_dir().join("inbox_settings_definitely_missing.toml");
    let err = load_settings_from(Some(&path), no_env).expect_err("must fail");
    assert!(matches!(err, SettingsError::Read { .. }));
}
