//! Spawn configuration read from the worker's environment.

use std::path::PathBuf;

use gantry_proto::spawn::{CODE_PATH_ENV, HANDLER_ENV, SCHEMA_ENV, SOCKET_PATH_ENV};
use gantry_proto::SchemaDescriptor;

use crate::error::BridgeError;

/// Everything a worker needs before it can accept a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Registered handler to serve.
    pub handler: String,
    /// Directory holding the handler's code and assets.
    pub code_path: PathBuf,
    /// Socket to bind.
    pub socket_path: PathBuf,
    /// Protocol the supervisor speaks.
    pub schema: SchemaDescriptor,
}

impl SpawnConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary variable lookup.
    ///
    /// Empty values are treated the same as missing ones.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &'static str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or(BridgeError::MissingEnv(key))
        };

        let handler = require(HANDLER_ENV)?;
        let code_path = PathBuf::from(require(CODE_PATH_ENV)?);
        let socket_path = PathBuf::from(require(SOCKET_PATH_ENV)?);
        let schema = SchemaDescriptor::from_base64(&require(SCHEMA_ENV)?)?;

        Ok(Self {
            handler,
            code_path,
            socket_path,
            schema,
        })
    }

    /// Checks the schema and code path before anything is bound.
    pub fn validate(&self) -> Result<(), BridgeError> {
        self.schema.ensure_compatible()?;

        if !self.code_path.exists() {
            return Err(BridgeError::CodePathMissing(self.code_path.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use gantry_proto::ProtocolError;
    use rstest::rstest;

    fn full_env(code_path: &str) -> HashMap<&'static str, String> {
        HashMap::from([
            (HANDLER_ENV, "handler".to_owned()),
            (CODE_PATH_ENV, code_path.to_owned()),
            (SOCKET_PATH_ENV, "/tmp/.gantry-test.sock".to_owned()),
            (SCHEMA_ENV, SchemaDescriptor::current().to_base64().unwrap()),
        ])
    }

    #[test]
    fn reads_all_four_variables() {
        let dir = tempfile::tempdir().unwrap();
        let env = full_env(dir.path().to_str().unwrap());

        let config = SpawnConfig::from_lookup(|k| env.get(k).cloned()).unwrap();

        assert_eq!(config.handler, "handler");
        assert_eq!(config.code_path, dir.path());
        assert_eq!(config.socket_path, PathBuf::from("/tmp/.gantry-test.sock"));
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case(HANDLER_ENV)]
    #[case(CODE_PATH_ENV)]
    #[case(SOCKET_PATH_ENV)]
    #[case(SCHEMA_ENV)]
    fn each_variable_is_mandatory(#[case] missing: &'static str) {
        let mut env = full_env("/tmp");
        env.remove(missing);

        let err = SpawnConfig::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, BridgeError::MissingEnv(name) if name == missing));
    }

    #[test]
    fn blank_value_counts_as_missing() {
        let mut env = full_env("/tmp");
        env.insert(HANDLER_ENV, "  ".to_owned());

        let err = SpawnConfig::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, BridgeError::MissingEnv(HANDLER_ENV)));
    }

    #[test]
    fn schema_mismatch_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = full_env(dir.path().to_str().unwrap());
        let stale = SchemaDescriptor {
            version: 1,
            fingerprint: "ff".repeat(32),
        };
        env.insert(SCHEMA_ENV, stale.to_base64().unwrap());

        let config = SpawnConfig::from_lookup(|k| env.get(k).cloned()).unwrap();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::Protocol(ProtocolError::SchemaMismatch { .. }))
        ));
    }

    #[test]
    fn missing_code_path_fails_validation() {
        let env = full_env("/definitely/not/here");
        let config = SpawnConfig::from_lookup(|k| env.get(k).cloned()).unwrap();

        assert!(matches!(
            config.validate(),
            Err(BridgeError::CodePathMissing(_))
        ));
    }
}
