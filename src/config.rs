use std::env;
use std::path::PathBuf;

use crate::cache::settings::CacheConfigUpdate;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub base_url: String,
    pub is_dev: bool,
    /// Root directory holding the media cache and the settings file
    pub cache_root: PathBuf,
    /// Cache budget overrides; unset fields fall back to the settings file, then defaults
    pub cache_overrides: CacheConfigUpdate,
    /// Allow media URLs that resolve to loopback or private ranges
    pub allow_private_origins: bool,
    /// Idle lifetime of a player item in seconds (default: 300)
    pub item_ttl_secs: u64,
    /// Seconds between periodic cache sweeps; 0 disables them (default: 600)
    pub clean_interval_secs: u64,
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{} is invalid: {}", name, e).into()),
        Err(_) => Ok(None),
    }
}

fn parse_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT and CACHE_ROOT are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = parse_flag("DEV_MODE").unwrap_or(false);

        // Port: required in prod, defaults to 3000 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let base_url =
            env::var("BASE_URL").unwrap_or_else(|_| format!("http://localhost:{}", port));

        // Cache root: required in prod, temp dir in dev
        let cache_root = if is_dev {
            env::var("CACHE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("rangecache"))
        } else {
            env::var("CACHE_ROOT")
                .map(PathBuf::from)
                .map_err(|_| "CACHE_ROOT is required in production")?
        };

        let cache_overrides = CacheConfigUpdate {
            max_cache_count: parse_var("MAX_CACHE_COUNT")?,
            max_cache_size_bytes: parse_var("MAX_CACHE_SIZE_BYTES")?,
            max_cache_age_seconds: parse_var("MAX_CACHE_AGE_SECS")?,
            auto_clean_cache: parse_flag("AUTO_CLEAN_CACHE"),
        };

        // Private origins are reachable by default only in dev
        let allow_private_origins = parse_flag("ALLOW_PRIVATE_ORIGINS").unwrap_or(is_dev);

        let item_ttl_secs = parse_var("ITEM_TTL_SECS")?.unwrap_or(300);
        let clean_interval_secs = parse_var("CLEAN_INTERVAL_SECS")?.unwrap_or(600);

        Ok(Config {
            port,
            base_url,
            is_dev,
            cache_root,
            cache_overrides,
            allow_private_origins,
            item_ttl_secs,
            clean_interval_secs,
        })
    }

    /// Dev-mode configuration rooted at `cache_root`, for tests and embedding.
    pub fn for_cache_root(cache_root: impl Into<PathBuf>) -> Self {
        Config {
            port: 0,
            base_url: "http://localhost".to_string(),
            is_dev: true,
            cache_root: cache_root.into(),
            cache_overrides: CacheConfigUpdate::default(),
            allow_private_origins: true,
            item_ttl_secs: 300,
            clean_interval_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialize all env-var tests to prevent races between parallel test threads.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "DEV_MODE",
        "PORT",
        "BASE_URL",
        "CACHE_ROOT",
        "MAX_CACHE_COUNT",
        "MAX_CACHE_SIZE_BYTES",
        "MAX_CACHE_AGE_SECS",
        "AUTO_CLEAN_CACHE",
        "ALLOW_PRIVATE_ORIGINS",
        "ITEM_TTL_SECS",
        "CLEAN_INTERVAL_SECS",
    ];

    /// Clear every config var, set `set`, run `f`, then restore original state.
    fn with_env(set: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let saved: Vec<(&str, Option<String>)> =
            ALL_VARS.iter().map(|k| (*k, env::var(k).ok())).collect();

        for k in ALL_VARS {
            // SAFETY: serialized by ENV_LOCK; no other thread touches env vars concurrently.
            unsafe { env::remove_var(k) };
        }
        for (k, v) in set {
            unsafe { env::set_var(k, v) };
        }

        f();

        for (k, old) in saved {
            match old {
                Some(v) => unsafe { env::set_var(k, v) },
                None => unsafe { env::remove_var(k) },
            }
        }
    }

    #[test]
    fn dev_mode_uses_defaults() {
        with_env(&[("DEV_MODE", "true")], || {
            let config = Config::from_env().expect("should succeed in dev mode");
            assert!(config.is_dev);
            assert_eq!(config.port, 3000);
            assert_eq!(config.base_url, "http://localhost:3000");
            assert!(config.cache_root.ends_with("rangecache"));
            assert!(config.cache_overrides.is_empty());
            assert!(config.allow_private_origins);
            assert_eq!(config.item_ttl_secs, 300);
            assert_eq!(config.clean_interval_secs, 600);
        });
    }

    #[test]
    fn prod_mode_requires_port() {
        with_env(&[("CACHE_ROOT", "/var/cache/media")], || {
            assert!(Config::from_env().is_err(), "Should fail without PORT in prod mode");
        });
    }

    #[test]
    fn prod_mode_requires_cache_root() {
        with_env(&[("PORT", "8080")], || {
            assert!(
                Config::from_env().is_err(),
                "Should fail without CACHE_ROOT in prod mode"
            );
        });
    }

    #[test]
    fn prod_mode_blocks_private_origins_by_default() {
        with_env(&[("PORT", "8080"), ("CACHE_ROOT", "/var/cache/media")], || {
            let config = Config::from_env().unwrap();
            assert!(!config.is_dev);
            assert!(!config.allow_private_origins);
            assert_eq!(config.cache_root, PathBuf::from("/var/cache/media"));
        });
    }

    #[test]
    fn cache_overrides_parsed() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("MAX_CACHE_COUNT", "10"),
                ("MAX_CACHE_SIZE_BYTES", "1000000"),
                ("MAX_CACHE_AGE_SECS", "60"),
                ("AUTO_CLEAN_CACHE", "false"),
            ],
            || {
                let overrides = Config::from_env().unwrap().cache_overrides;
                assert_eq!(overrides.max_cache_count, Some(10));
                assert_eq!(overrides.max_cache_size_bytes, Some(1_000_000));
                assert_eq!(overrides.max_cache_age_seconds, Some(60));
                assert_eq!(overrides.auto_clean_cache, Some(false));
            },
        );
    }

    #[test]
    fn invalid_number_is_an_error() {
        with_env(&[("DEV_MODE", "true"), ("MAX_CACHE_COUNT", "lots")], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("MAX_CACHE_COUNT"));
        });
    }

    #[test]
    fn private_origins_flag_overrides_mode() {
        with_env(&[("DEV_MODE", "true"), ("ALLOW_PRIVATE_ORIGINS", "false")], || {
            assert!(!Config::from_env().unwrap().allow_private_origins);
        });
    }

    #[test]
    fn ttl_and_interval_parsed() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("ITEM_TTL_SECS", "30"),
                ("CLEAN_INTERVAL_SECS", "0"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.item_ttl_secs, 30);
                assert_eq!(config.clean_interval_secs, 0);
            },
        );
    }
}
