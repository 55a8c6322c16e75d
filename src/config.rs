//! Analysis parameters.
//!
//! Defaults match the values the analysis was tuned with. The driver reads
//! overrides from the environment, the same way it picks the detector through
//! `DETECTOR_TYPE`.

use std::env;

use crate::error::{Error, Result};

pub const ENV_PATH_DEPTH: &str = "DETECTOR_PATH_DEPTH";
pub const ENV_ENTRY: &str = "DETECTOR_ENTRY";
pub const ENV_REFINE_INDIRECT: &str = "DETECTOR_REFINE_INDIRECT";
pub const ENV_DUMP_CFG: &str = "DETECTOR_DUMP_CFG";
pub const ENV_DUMP_DDG: &str = "DETECTOR_DUMP_DDG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximal call-path length enumerated when refining possible def/use
    /// information along call chains.
    pub path_depth: usize,
    /// Name of the function every reachability query starts from.
    pub entry_function: String,
    /// Bind newly discovered indirect callees inside the points-to solver.
    pub refine_indirect_calls: bool,
    pub dump_cfg: bool,
    pub dump_ddg: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path_depth: 5,
            entry_function: "main".to_owned(),
            refine_indirect_calls: true,
            dump_cfg: false,
            dump_ddg: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. `from_env` passes the
    /// process environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(value) = lookup(ENV_PATH_DEPTH) {
            config.path_depth = match value.trim().parse::<usize>() {
                Ok(depth) if depth > 0 => depth,
                _ => {
                    return Err(Error::InvalidConfig {
                        key: ENV_PATH_DEPTH,
                        value,
                    })
                }
            };
        }
        if let Some(value) = lookup(ENV_ENTRY) {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig { key: ENV_ENTRY, value });
            }
            config.entry_function = value.trim().to_owned();
        }
        if let Some(value) = lookup(ENV_REFINE_INDIRECT) {
            config.refine_indirect_calls = parse_flag(ENV_REFINE_INDIRECT, value)?;
        }
        if let Some(value) = lookup(ENV_DUMP_CFG) {
            config.dump_cfg = parse_flag(ENV_DUMP_CFG, value)?;
        }
        if let Some(value) = lookup(ENV_DUMP_DDG) {
            config.dump_ddg = parse_flag(ENV_DUMP_DDG, value)?;
        }
        Ok(config)
    }
}

fn parse_flag(key: &'static str, value: String) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        _ => Err(Error::InvalidConfig { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_default_config() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.path_depth, 5);
        assert_eq!(config.entry_function, "main");
        assert!(config.refine_indirect_calls);
    }

    #[test]
    fn test_env_overrides() {
        let mut map = HashMap::new();
        map.insert(ENV_PATH_DEPTH, "3");
        map.insert(ENV_ENTRY, "start");
        map.insert(ENV_DUMP_CFG, "1");
        map.insert(ENV_REFINE_INDIRECT, "off");
        let config = Config::from_lookup(lookup_in(map)).unwrap();
        assert_eq!(config.path_depth, 3);
        assert_eq!(config.entry_function, "start");
        assert!(config.dump_cfg);
        assert!(!config.dump_ddg);
        assert!(!config.refine_indirect_calls);
    }

    #[test]
    fn test_invalid_values() {
        let mut map = HashMap::new();
        map.insert(ENV_PATH_DEPTH, "zero");
        assert!(matches!(
            Config::from_lookup(lookup_in(map)),
            Err(Error::InvalidConfig { key: ENV_PATH_DEPTH, .. })
        ));

        let mut map = HashMap::new();
        map.insert(ENV_PATH_DEPTH, "0");
        assert!(Config::from_lookup(lookup_in(map)).is_err());

        let mut map = HashMap::new();
        map.insert(ENV_DUMP_DDG, "maybe");
        assert!(matches!(
            Config::from_lookup(lookup_in(map)),
            Err(Error::InvalidConfig { key: ENV_DUMP_DDG, .. })
        ));
    }
}
