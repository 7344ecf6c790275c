use std::time::Duration;

use serde::Deserialize;

/// Connection settings shared by the gateway and the worker manager.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Logical consumer group. The work queue is named `<consumer_name>requests`.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// How long one receive call blocks waiting for work.
    #[serde(default = "default_poll_interval", deserialize_with = "duration::deserialize")]
    pub poll_interval: Duration,

    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            consumer_name: default_consumer_name(),
            poll_interval: default_poll_interval(),
            backend: BackendConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Name of the shared work queue.
    pub fn work_queue(&self) -> String {
        work_queue_name(&self.consumer_name)
    }

    /// Rejects settings that would stall a consumer or collide queue names.
    pub fn validate(&self) -> Result<(), String> {
        if self.consumer_name.trim().is_empty() {
            return Err("broker.consumer_name is empty".to_owned());
        }
        // A zero wait would block a Valkey receive until work arrives.
        if self.poll_interval.is_zero() {
            return Err("broker.poll_interval must be positive".to_owned());
        }
        Ok(())
    }
}

/// The work queue a consumer group drains.
pub fn work_queue_name(consumer_name: &str) -> String {
    format!("{consumer_name}requests")
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    #[default]
    Memory,
    #[cfg(feature = "valkey")]
    Valkey {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
}

fn default_consumer_name() -> String {
    "gantry".to_string()
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

#[cfg(feature = "valkey")]
fn default_namespace() -> String {
    "gantry".to_string()
}

#[cfg(feature = "valkey")]
fn default_pool_size() -> usize {
    10
}

/// Human-readable durations in configuration files: `"100ms"`, `"3s"`, `"1m"`, `"60"`.
pub mod duration {
    use std::time::Duration;

    use serde::Deserialize;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Environment providers hand bare numbers over as integers.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |digits: &str| -> Result<u64, String> {
            digits
                .trim()
                .parse()
                .map_err(|_| format!("Invalid duration: {s}"))
        };

        if let Some(stripped) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(number(stripped)?))
        } else if let Some(stripped) = s.strip_suffix('s') {
            Ok(Duration::from_secs(number(stripped)?))
        } else if let Some(stripped) = s.strip_suffix('m') {
            number(stripped)?
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("Invalid duration: {s}"))
        } else {
            Ok(Duration::from_secs(number(s)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::{Format, Toml};
    use figment::Figment;
    use rstest::rstest;

    #[rstest]
    #[case("30s", Duration::from_secs(30))]
    #[case("100ms", Duration::from_millis(100))]
    #[case("5m", Duration::from_secs(300))]
    #[case("60", Duration::from_secs(60))]
    #[case(" 900ms ", Duration::from_millis(900))]
    fn parse_duration(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(duration::parse(input).unwrap(), expected);
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(duration::parse("soon").is_err());
        assert!(duration::parse("10h").is_err());
    }

    #[test]
    fn parse_duration_rejects_overflowing_minutes() {
        let minutes = format!("{}m", u64::MAX / 30);
        assert!(duration::parse(&minutes).is_err());
    }

    #[rstest]
    #[case::zero_poll_interval("poll_interval = \"0s\"")]
    #[case::bare_zero("poll_interval = 0")]
    #[case::blank_consumer("consumer_name = \"  \"")]
    fn validate_rejects(#[case] toml: &str) {
        let config: BrokerConfig = Figment::new().merge(Toml::string(toml)).extract().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn bare_integer_is_seconds() {
        let config: BrokerConfig = Figment::new()
            .merge(Toml::string("poll_interval = 2"))
            .extract()
            .unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn work_queue_is_consumer_name_plus_requests() {
        assert_eq!(work_queue_name("lambda"), "lambdarequests");
        assert_eq!(BrokerConfig::default().work_queue(), "gantryrequests");
    }

    #[test]
    fn defaults_to_memory_backend() {
        let config: BrokerConfig = Figment::new().merge(Toml::string("")).extract().unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.backend, BackendConfig::Memory);
    }

    #[cfg(feature = "valkey")]
    #[test]
    fn valkey_backend_from_toml() {
        let config: BrokerConfig = Figment::new()
            .merge(Toml::string(
                r#"
                consumer_name = "lambda"
                poll_interval = "250ms"

                [backend]
                kind = "valkey"
                url = "redis://127.0.0.1:6379"
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(config.consumer_name, "lambda");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(
            config.backend,
            BackendConfig::Valkey {
                url: "redis://127.0.0.1:6379".to_string(),
                namespace: "gantry".to_string(),
                pool_size: 10,
            }
        );
    }
}
