//! Integration tests for configuration loading: TOML file plus environment
//! overrides layered through `config::Config`, mirroring
//! `mitigation-node/tests/integration_tests.rs`'s configuration-reload
//! coverage.

use engine_node::config::EngineConfig;

fn write_toml(contents: &str) -> tempfile_path::TempToml {
    tempfile_path::TempToml::new(contents)
}

/// A tiny scratch-file helper so this test doesn't need a `tempfile`
/// dependency just to write one throwaway TOML file.
mod tempfile_path {
    use std::fs;
    use std::path::PathBuf;

    pub struct TempToml {
        pub path: PathBuf,
    }

    impl TempToml {
        pub fn new(contents: &str) -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("engine-node-config-test-{}.toml", std::process::id()));
            let mut file = fs::File::create(&path).expect("create temp config file");
            use std::io::Write as _;
            file.write_all(contents.as_bytes()).expect("write temp config file");
            Self { path }
        }
    }

    impl Drop for TempToml {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[test]
fn loads_detector_settings_from_file() {
    let toml = write_toml(
        r#"
        detector_type = "seasonal"
        threshold = 2.5
        window_size = 50

        [alerting]
        max_alerts_per_minute = 5
        "#,
    );
    let config = EngineConfig::from_file(toml.path.to_str().unwrap()).expect("config should load");
    assert_eq!(config.detector_type, "seasonal");
    assert_eq!(config.threshold, 2.5);
    assert_eq!(config.window_size, 50);
    assert_eq!(config.alerting.max_alerts_per_minute, 5);
    // Fields absent from the file keep their serde defaults.
    assert_eq!(config.alerting.max_alerts_per_hour, 1000);
    assert!(config.validate().is_ok());
}

#[test]
fn environment_override_wins_over_file() {
    let toml = write_toml(r#"detector_type = "zscore""#);
    std::env::set_var("ENGINE__DETECTOR_TYPE", "knn");
    let config = EngineConfig::from_file(toml.path.to_str().unwrap()).expect("config should load");
    std::env::remove_var("ENGINE__DETECTOR_TYPE");
    assert_eq!(config.detector_type, "knn");
}

#[test]
fn missing_file_falls_back_to_defaults_via_builder() {
    let config = EngineConfig::from_file("/nonexistent/path/does-not-exist.toml").expect("missing file is not required");
    let default = EngineConfig::default();
    assert_eq!(config.detector_type, default.detector_type);
    assert_eq!(config.threshold, default.threshold);
    assert_eq!(config.window_size, default.window_size);
    assert_eq!(config.alerting.max_alerts_per_minute, default.alerting.max_alerts_per_minute);
}

#[test]
fn empty_detector_type_fails_validation() {
    let mut config = EngineConfig::default();
    config.detector_type = String::new();
    assert!(config.validate().is_err());
}

#[test]
fn zero_rate_limit_fails_validation() {
    let mut config = EngineConfig::default();
    config.alerting.max_alerts_per_minute = 0;
    assert!(config.validate().is_err());
}
