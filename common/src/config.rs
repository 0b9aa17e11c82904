//! Configuración por variables de entorno `TIMEVIS_*`. Un valor que no
//! parsea se ignora y queda el default.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::{DEFAULT_MAX_DELIVERIES, DEFAULT_WORKER_CONCURRENCY};
use crate::job::DataType;
use crate::sweeper::{DEFAULT_RETENTION_DAYS, DEFAULT_SWEEP_INTERVAL, MAX_RETENTION_DAYS};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_DATA_ROOT: &str = "./data";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind_addr: String,
    pub data_root: PathBuf,
    pub registry_path: PathBuf,
    pub worker_concurrency: usize,
    pub max_deliveries: u32,
    pub retention_days: i64,
    pub sweep_interval: Duration,
    /// Si está, se escanea al arrancar y se registran los CSV encontrados.
    pub dataset_glob: Option<String>,
    /// Tipo con el que se registran los CSV del scan de arranque.
    pub dataset_type: DataType,
}

impl Default for Settings {
    fn default() -> Self {
        let data_root = PathBuf::from(DEFAULT_DATA_ROOT);
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            registry_path: data_root.join("registry.json"),
            data_root,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            retention_days: DEFAULT_RETENTION_DAYS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            dataset_glob: None,
            dataset_type: DataType::Weather,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con otra fuente de variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Settings::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let num = |key: &str| get(key).map(|v| v.trim().to_string());

        let data_root = get("TIMEVIS_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_root);
        let registry_path = get("TIMEVIS_REGISTRY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join("registry.json"));

        Self {
            bind_addr: get("TIMEVIS_BIND_ADDR").unwrap_or(defaults.bind_addr),
            data_root,
            registry_path,
            worker_concurrency: num("TIMEVIS_WORKER_CONCURRENCY")
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.worker_concurrency),
            max_deliveries: num("TIMEVIS_MAX_DELIVERIES")
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_deliveries),
            retention_days: num("TIMEVIS_RETENTION_DAYS")
                .and_then(|s| s.parse::<i64>().ok())
                .filter(|n| (0..=MAX_RETENTION_DAYS).contains(n))
                .unwrap_or(defaults.retention_days),
            sweep_interval: num("TIMEVIS_SWEEP_INTERVAL_SECS")
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            dataset_glob: get("TIMEVIS_DATASET_GLOB"),
            dataset_type: get("TIMEVIS_DATASET_TYPE")
                .and_then(|s| s.parse::<DataType>().ok())
                .unwrap_or(defaults.dataset_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn sin_variables_usa_defaults() {
        let s = settings(&[]);
        assert_eq!(s, Settings::default());
        assert_eq!(s.registry_path, PathBuf::from("./data/registry.json"));
        assert_eq!(s.sweep_interval, Duration::from_secs(86_400));
    }

    #[test]
    fn registry_path_sigue_a_data_root() {
        let s = settings(&[("TIMEVIS_DATA_ROOT", "/srv/timevis")]);
        assert_eq!(s.registry_path, PathBuf::from("/srv/timevis/registry.json"));

        let s = settings(&[
            ("TIMEVIS_DATA_ROOT", "/srv/timevis"),
            ("TIMEVIS_REGISTRY_PATH", "/var/lib/reg.json"),
        ]);
        assert_eq!(s.registry_path, PathBuf::from("/var/lib/reg.json"));
    }

    #[test]
    fn valores_invalidos_caen_al_default() {
        let s = settings(&[
            ("TIMEVIS_WORKER_CONCURRENCY", "muchos"),
            ("TIMEVIS_MAX_DELIVERIES", "0"),
            ("TIMEVIS_RETENTION_DAYS", " 14 "),
            ("TIMEVIS_DATASET_GLOB", ""),
            ("TIMEVIS_DATASET_TYPE", "Traffic"),
        ]);
        assert_eq!(s.worker_concurrency, DEFAULT_WORKER_CONCURRENCY);
        assert_eq!(s.max_deliveries, DEFAULT_MAX_DELIVERIES);
        assert_eq!(s.retention_days, 14);
        assert!(s.dataset_glob.is_none());
        assert_eq!(s.dataset_type, DataType::Traffic);
    }

    #[test]
    fn retencion_fuera_de_rango_cae_al_default() {
        for raw in ["1000000000", "-1"] {
            let s = settings(&[("TIMEVIS_RETENTION_DAYS", raw)]);
            assert_eq!(s.retention_days, DEFAULT_RETENTION_DAYS, "{raw}");
        }
        let s = settings(&[("TIMEVIS_RETENTION_DAYS", "36500")]);
        assert_eq!(s.retention_days, MAX_RETENTION_DAYS);
    }
}
