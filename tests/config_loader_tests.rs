use calendar_sync::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const REQUIRED: &str = "CALSYNC_OPERATOR_TOKEN=test-operator\n\
CALSYNC_CRYPTO_KEY=000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f\n\
CALSYNC_STATE_SECRET=state-secret-for-config-tests-0123456789\n";

const TOUCHED_VARS: &[&str] = &[
    "CALSYNC_PROFILE",
    "CALSYNC_API_BIND_ADDR",
    "CALSYNC_LOG_LEVEL",
    "CALSYNC_CRYPTO_KEY",
    "CALSYNC_STATE_SECRET",
    "CALSYNC_OPERATOR_TOKEN",
    "CALSYNC_OPERATOR_TOKENS",
    "CALSYNC_SYNC_RANGE_START_DAYS",
    "CALSYNC_PROPAGATE_DELETIONS",
];

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    for name in TOUCHED_VARS {
        unsafe {
            env::remove_var(name);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_only_secrets_are_present() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", REQUIRED);

    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.operator_tokens, vec!["test-operator".to_string()]);
    assert_eq!((cfg.sync_range_start_days, cfg.sync_range_end_days), (-7, 28));
    assert!(!cfg.propagate_deletions);
    assert!(cfg.is_dev_profile());
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!("{}CALSYNC_API_BIND_ADDR=127.0.0.1:3000\n", REQUIRED),
    );
    write_env_file(
        &temp_dir,
        ".env.test",
        "CALSYNC_API_BIND_ADDR=192.168.0.10:5000\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "CALSYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );
    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "CALSYNC_PROFILE=test\nCALSYNC_API_BIND_ADDR=127.0.0.1:4000\n",
    );

    let cfg = loader(&temp_dir).load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!("{}CALSYNC_API_BIND_ADDR=127.0.0.1:3000\n", REQUIRED),
    );

    unsafe {
        env::set_var("CALSYNC_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("CALSYNC_OPERATOR_TOKENS", "alpha, beta,,");
    }

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.operator_tokens, vec!["alpha".to_string(), "beta".to_string()]);

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", REQUIRED);

    unsafe {
        env::set_var("CALSYNC_API_BIND_ADDR", "not-an-addr");
    }
    let err = loader(&temp_dir).load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn missing_secrets_are_reported() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "CALSYNC_OPERATOR_TOKEN=test-operator\n");

    let err = loader(&temp_dir).load().expect_err("crypto key is required");
    assert!(matches!(err, ConfigError::MissingCryptoKey));

    write_env_file(
        &temp_dir,
        ".env",
        "CALSYNC_OPERATOR_TOKEN=test-operator\n\
         CALSYNC_CRYPTO_KEY=000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f\n\
         CALSYNC_STATE_SECRET=short\n",
    );
    let err = loader(&temp_dir).load().expect_err("short state secret is rejected");
    assert!(matches!(err, ConfigError::StateSecretTooShort { length: 5 }));
    clear_env();
}

#[test]
fn sync_range_must_straddle_now() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!("{}CALSYNC_SYNC_RANGE_START_DAYS=3\n", REQUIRED),
    );

    let err = loader(&temp_dir).load().expect_err("positive start is rejected");
    assert!(matches!(err, ConfigError::InvalidSyncRange { start: 3, .. }));
    clear_env();
}

#[test]
fn unparseable_numbers_and_flags_are_rejected() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!("{}CALSYNC_PROPAGATE_DELETIONS=maybe\n", REQUIRED),
    );

    let err = loader(&temp_dir).load().expect_err("invalid flag is rejected");
    assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name == "PROPAGATE_DELETIONS"));
    clear_env();
}
