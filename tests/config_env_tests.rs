//! Integration tests for ProcessorOptions::from_env() and LogFormat::from_env()
//!
//! These tests verify configuration loading from environment variables.

use changefeed::feed::{CheckpointFrequency, ProcessorOptions};
use changefeed::telemetry::LogFormat;
use changefeed::types::StartFrom;
use std::env;
use std::sync::Mutex;
use std::time::Duration;

/// Global mutex to serialize all env-based tests.
/// Environment variables are process-global, so we must prevent concurrent access.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// All environment variables read by the functions under test.
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "CHANGEFEED_HOST_NAME",
    "CHANGEFEED_LEASE_PREFIX",
    "CHANGEFEED_MIN_SCALE_COUNT",
    "CHANGEFEED_MAX_SCALE_COUNT",
    "CHANGEFEED_LEASE_EXPIRATION_SECS",
    "CHANGEFEED_LEASE_RENEW_SECS",
    "CHANGEFEED_LEASE_ACQUIRE_SECS",
    "CHANGEFEED_FEED_POLL_DELAY_MS",
    "CHANGEFEED_MAX_ITEM_COUNT",
    "CHANGEFEED_CHECKPOINT_EXPLICIT",
    "CHANGEFEED_CHECKPOINT_DOCUMENT_COUNT",
    "CHANGEFEED_CHECKPOINT_INTERVAL_MS",
    "CHANGEFEED_START_FROM",
    "CHANGEFEED_BOOTSTRAP_LOCK_TTL_SECS",
    "CHANGEFEED_BOOTSTRAP_SLEEP_SECS",
    "CHANGEFEED_BOOTSTRAP_MAX_ATTEMPTS",
    "LOG_FORMAT",
];

/// Run `f` with exactly `vars` set among the config variables.
///
/// Holds the env mutex for the duration and restores every config variable
/// afterwards.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let all_originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }

    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in all_originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

// ============================================================================
// ProcessorOptions
// ============================================================================

#[test]
fn test_from_env_defaults() {
    with_env_vars(&[], || {
        let options = ProcessorOptions::from_env().expect("Should parse options");
        let defaults = ProcessorOptions::default();
        assert!(options.host_name.starts_with("host-"));
        assert_eq!(options.lease_prefix, "");
        assert_eq!(options.lease_expiration_interval, defaults.lease_expiration_interval);
        assert_eq!(options.lease_renew_interval, defaults.lease_renew_interval);
        assert_eq!(options.max_item_count, defaults.max_item_count);
        assert_eq!(options.start_from, StartFrom::Now);
        assert_eq!(options.checkpoint_frequency, CheckpointFrequency::default());
        assert!(options.validate().is_ok());
    });
}

#[test]
fn test_from_env_with_host_and_prefix() {
    with_env_vars(
        &[
            ("CHANGEFEED_HOST_NAME", "worker-7"),
            ("CHANGEFEED_LEASE_PREFIX", "orders"),
        ],
        || {
            let options = ProcessorOptions::from_env().expect("Should parse options");
            assert_eq!(options.host_name, "worker-7");
            assert_eq!(options.lease_prefix, "orders");
        },
    );
}

#[test]
fn test_from_env_with_lease_timings() {
    with_env_vars(
        &[
            ("CHANGEFEED_LEASE_EXPIRATION_SECS", "30"),
            ("CHANGEFEED_LEASE_RENEW_SECS", "10"),
            ("CHANGEFEED_LEASE_ACQUIRE_SECS", "5"),
            ("CHANGEFEED_FEED_POLL_DELAY_MS", "250"),
        ],
        || {
            let options = ProcessorOptions::from_env().expect("Should parse options");
            assert_eq!(options.lease_expiration_interval, Duration::from_secs(30));
            assert_eq!(options.lease_renew_interval, Duration::from_secs(10));
            assert_eq!(options.lease_acquire_interval, Duration::from_secs(5));
            assert_eq!(options.feed_poll_delay, Duration::from_millis(250));
        },
    );
}

#[test]
fn test_from_env_with_scale_bounds() {
    with_env_vars(
        &[
            ("CHANGEFEED_MIN_SCALE_COUNT", "2"),
            ("CHANGEFEED_MAX_SCALE_COUNT", "8"),
            ("CHANGEFEED_MAX_ITEM_COUNT", "500"),
        ],
        || {
            let options = ProcessorOptions::from_env().expect("Should parse options");
            assert_eq!(options.min_scale_count, 2);
            assert_eq!(options.max_scale_count, 8);
            assert_eq!(options.max_item_count, 500);
        },
    );
}

#[test]
fn test_from_env_with_checkpoint_frequency() {
    with_env_vars(
        &[
            ("CHANGEFEED_CHECKPOINT_DOCUMENT_COUNT", "50"),
            ("CHANGEFEED_CHECKPOINT_INTERVAL_MS", "2000"),
        ],
        || {
            let options = ProcessorOptions::from_env().expect("Should parse options");
            assert!(!options.checkpoint_frequency.explicit);
            assert_eq!(options.checkpoint_frequency.document_count, Some(50));
            assert_eq!(
                options.checkpoint_frequency.time_interval,
                Some(Duration::from_millis(2000))
            );
        },
    );
}

#[test]
fn test_from_env_explicit_checkpointing() {
    for value in ["true", "TRUE", "1"] {
        with_env_vars(&[("CHANGEFEED_CHECKPOINT_EXPLICIT", value)], || {
            let options = ProcessorOptions::from_env().expect("Should parse options");
            assert!(options.checkpoint_frequency.explicit, "value {:?}", value);
        });
    }
    with_env_vars(&[("CHANGEFEED_CHECKPOINT_EXPLICIT", "no")], || {
        let options = ProcessorOptions::from_env().expect("Should parse options");
        assert!(!options.checkpoint_frequency.explicit);
    });
}

#[test]
fn test_from_env_start_from_variants() {
    with_env_vars(&[("CHANGEFEED_START_FROM", "beginning")], || {
        let options = ProcessorOptions::from_env().expect("Should parse options");
        assert_eq!(options.start_from, StartFrom::Beginning);
    });
    with_env_vars(&[("CHANGEFEED_START_FROM", "NOW")], || {
        let options = ProcessorOptions::from_env().expect("Should parse options");
        assert_eq!(options.start_from, StartFrom::Now);
    });
    with_env_vars(&[("CHANGEFEED_START_FROM", "2024-05-01T12:00:00Z")], || {
        let options = ProcessorOptions::from_env().expect("Should parse options");
        match options.start_from {
            StartFrom::Time(t) => assert_eq!(t.to_rfc3339(), "2024-05-01T12:00:00+00:00"),
            other => panic!("expected a point in time, got {:?}", other),
        }
    });
}

#[test]
fn test_from_env_invalid_start_from_is_error() {
    with_env_vars(&[("CHANGEFEED_START_FROM", "yesterday")], || {
        let err = ProcessorOptions::from_env().unwrap_err();
        assert!(err.to_string().contains("CHANGEFEED_START_FROM"));
    });
}

#[test]
fn test_from_env_invalid_numbers_fall_back_to_defaults() {
    with_env_vars(
        &[
            ("CHANGEFEED_MAX_ITEM_COUNT", "lots"),
            ("CHANGEFEED_LEASE_RENEW_SECS", "-3"),
            ("CHANGEFEED_BOOTSTRAP_MAX_ATTEMPTS", "x"),
        ],
        || {
            let options = ProcessorOptions::from_env().expect("Should parse options");
            let defaults = ProcessorOptions::default();
            assert_eq!(options.max_item_count, defaults.max_item_count);
            assert_eq!(options.lease_renew_interval, defaults.lease_renew_interval);
            assert_eq!(options.bootstrap_max_attempts, defaults.bootstrap_max_attempts);
        },
    );
}

#[test]
fn test_from_env_with_bootstrap_settings() {
    with_env_vars(
        &[
            ("CHANGEFEED_BOOTSTRAP_LOCK_TTL_SECS", "90"),
            ("CHANGEFEED_BOOTSTRAP_SLEEP_SECS", "3"),
            ("CHANGEFEED_BOOTSTRAP_MAX_ATTEMPTS", "4"),
        ],
        || {
            let options = ProcessorOptions::from_env().expect("Should parse options");
            assert_eq!(options.bootstrap_lock_ttl, Duration::from_secs(90));
            assert_eq!(options.bootstrap_sleep_time, Duration::from_secs(3));
            assert_eq!(options.bootstrap_max_attempts, 4);
        },
    );
}

#[test]
fn test_from_env_output_is_validated_separately() {
    with_env_vars(
        &[
            ("CHANGEFEED_LEASE_EXPIRATION_SECS", "10"),
            ("CHANGEFEED_LEASE_RENEW_SECS", "20"),
        ],
        || {
            let options = ProcessorOptions::from_env().expect("Should parse options");
            let errors = options.validate().unwrap_err();
            assert!(errors.iter().any(|e| e.contains("lease_renew_interval")));
        },
    );
}

// ============================================================================
// LogFormat
// ============================================================================

#[test]
fn test_log_format_from_env() {
    with_env_vars(&[("LOG_FORMAT", "json")], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
    });
    with_env_vars(&[("LOG_FORMAT", "pretty")], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
    with_env_vars(&[], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
}
