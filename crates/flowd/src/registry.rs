//! Experiment / activity registry.
//!
//! Maps human-readable experiment and activity names to the bounded ids
//! carried in fireflies and flow labels. Activity names are scoped to their
//! experiment: "production" may be 14 under one experiment and 2 under
//! another.
//!
//! The registry is loaded once at startup, either from the flow map API or
//! from a local JSON file with the same shape.

use crate::error::{FlowError, FlowResult};
use crate::flow::{FlowRecord, Identifier};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Experiment ids fit in 9 bits
pub const MAX_EXPERIMENT_ID: u32 = 511;

/// Activity ids fit in 6 bits; 0 means unspecified
pub const MAX_ACTIVITY_ID: u32 = 63;

#[derive(Debug, Deserialize)]
struct RawRegistry {
    experiments: Vec<RawExperiment>,
}

#[derive(Debug, Deserialize)]
struct RawExperiment {
    #[serde(alias = "expName")]
    name: String,
    #[serde(alias = "expId")]
    id: u32,
    #[serde(default)]
    activities: Vec<RawActivity>,
}

#[derive(Debug, Deserialize)]
struct RawActivity {
    #[serde(alias = "activityName")]
    name: String,
    #[serde(alias = "activityId")]
    id: u32,
}

/// Name to id lookup tables.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    experiments: HashMap<String, u16>,
    activities: HashMap<u16, HashMap<String, u8>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the flow map document. Entries with ids out of range are
    /// skipped with a warning.
    pub fn from_json(content: &str) -> FlowResult<Self> {
        let raw: RawRegistry = serde_json::from_str(content).map_err(|e| {
            FlowError::Configuration(format!("unable to parse experiment registry: {}", e))
        })?;

        let mut registry = Self::new();
        for exp in raw.experiments {
            if exp.id > MAX_EXPERIMENT_ID {
                warn!(
                    "Skipping experiment '{}': id {} exceeds {}",
                    exp.name, exp.id, MAX_EXPERIMENT_ID
                );
                continue;
            }
            let exp_id = exp.id as u16;
            registry.experiments.insert(exp.name.clone(), exp_id);
            let scoped = registry.activities.entry(exp_id).or_default();
            for act in exp.activities {
                if act.id > MAX_ACTIVITY_ID {
                    warn!(
                        "Skipping activity '{}' of '{}': id {} exceeds {}",
                        act.name, exp.name, act.id, MAX_ACTIVITY_ID
                    );
                    continue;
                }
                scoped.insert(act.name, act.id as u8);
            }
        }
        debug!("Registry: {:?}", registry);
        Ok(registry)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> FlowResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            FlowError::Configuration(format!(
                "failed to read registry file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let registry = Self::from_json(&content)?;
        info!(
            "Loaded {} experiments from {:?}",
            registry.len(),
            path.as_ref()
        );
        Ok(registry)
    }

    /// Fetch the flow map API once.
    pub async fn fetch(url: &str, insecure: bool) -> FlowResult<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FlowError::Configuration(format!("http client: {}", e)))?;

        let response = client.get(url).send().await.map_err(|e| {
            FlowError::Configuration(format!("failed to access flow map API at {}: {}", url, e))
        })?;
        if !response.status().is_success() {
            return Err(FlowError::Configuration(format!(
                "failed to access flow map API at {}, got {}",
                url,
                response.status()
            )));
        }
        let body = response.text().await.map_err(|e| {
            FlowError::Configuration(format!("failed to read flow map API response: {}", e))
        })?;

        let registry = Self::from_json(&body)?;
        info!("Loaded {} experiments from {}", registry.len(), url);
        Ok(registry)
    }

    pub fn insert_experiment(&mut self, name: &str, id: u16) {
        self.experiments.insert(name.to_string(), id);
        self.activities.entry(id).or_default();
    }

    pub fn insert_activity(&mut self, experiment_id: u16, name: &str, id: u8) {
        self.activities
            .entry(experiment_id)
            .or_default()
            .insert(name.to_string(), id);
    }

    /// Resolve an experiment name; ids pass through after a range check.
    pub fn resolve_experiment(&self, experiment: &Identifier) -> FlowResult<u16> {
        match experiment {
            Identifier::Id(id) if *id <= MAX_EXPERIMENT_ID => Ok(*id as u16),
            Identifier::Id(id) => Err(FlowError::experiment(id)),
            Identifier::Name(name) => self
                .experiments
                .get(name.trim())
                .copied()
                .ok_or_else(|| FlowError::experiment(name)),
        }
    }

    /// Resolve an activity within `experiment_id`. A missing or empty
    /// activity is the reserved id 0.
    pub fn resolve_activity(
        &self,
        experiment_id: u16,
        activity: Option<&Identifier>,
    ) -> FlowResult<u8> {
        match activity {
            None => Ok(0),
            Some(Identifier::Id(id)) if *id <= MAX_ACTIVITY_ID => Ok(*id as u8),
            Some(Identifier::Id(id)) => Err(FlowError::activity(id)),
            Some(Identifier::Name(name)) if name.trim().is_empty() => Ok(0),
            Some(Identifier::Name(name)) => self
                .activities
                .get(&experiment_id)
                .and_then(|scoped| scoped.get(name.trim()))
                .copied()
                .ok_or_else(|| FlowError::activity(name)),
        }
    }

    /// Resolve both identifiers of a record.
    pub fn resolve(&self, record: &FlowRecord) -> FlowResult<(u16, u8)> {
        let exp = self.resolve_experiment(record.experiment())?;
        let act = self.resolve_activity(exp, record.activity())?;
        Ok((exp, act))
    }

    /// Number of known experiments
    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowKey;
    use chrono::Utc;
    use std::io::Write;

    const FLOW_MAP: &str = r#"{
        "experiments": [
            {"expName": "atlas", "expId": 16, "activities": [
                {"activityName": "production", "activityId": 14},
                {"activityName": "rebalancing", "activityId": 16}
            ]},
            {"expName": "cms", "expId": 17, "activities": [
                {"activityName": "production", "activityId": 2}
            ]},
            {"expName": "huge", "expId": 900, "activities": []}
        ]
    }"#;

    #[test]
    fn test_resolve_names() {
        let reg = Registry::from_json(FLOW_MAP).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.resolve_experiment(&"atlas".into()).unwrap(), 16);
        assert_eq!(
            reg.resolve_activity(16, Some(&"production".into())).unwrap(),
            14
        );
        // Same activity name, different experiment
        assert_eq!(
            reg.resolve_activity(17, Some(&"production".into())).unwrap(),
            2
        );
    }

    #[test]
    fn test_passthrough_and_defaults() {
        let reg = Registry::new();
        assert_eq!(reg.resolve_experiment(&Identifier::Id(511)).unwrap(), 511);
        assert_eq!(reg.resolve_activity(3, Some(&Identifier::Id(63))).unwrap(), 63);
        assert_eq!(reg.resolve_activity(3, None).unwrap(), 0);
        assert_eq!(reg.resolve_activity(3, Some(&"".into())).unwrap(), 0);
    }

    #[test]
    fn test_unknown_and_out_of_range() {
        let reg = Registry::from_json(FLOW_MAP).unwrap();
        assert!(matches!(
            reg.resolve_experiment(&"lhcb".into()),
            Err(FlowError::IdentifierResolution { kind: "experiment", .. })
        ));
        assert!(matches!(
            reg.resolve_activity(17, Some(&"rebalancing".into())),
            Err(FlowError::IdentifierResolution { kind: "activity", .. })
        ));
        assert!(reg.resolve_experiment(&"huge".into()).is_err());
        assert!(reg.resolve_experiment(&Identifier::Id(512)).is_err());
        assert!(reg.resolve_activity(16, Some(&Identifier::Id(64))).is_err());
    }

    #[test]
    fn test_normalised_shape() {
        let reg = Registry::from_json(
            r#"{"experiments": [{"name": "dune", "id": 5, "activities": [{"name": "cache", "id": 3}]}]}"#,
        )
        .unwrap();
        assert_eq!(reg.resolve_experiment(&"dune".into()).unwrap(), 5);
        assert_eq!(reg.resolve_activity(5, Some(&"cache".into())).unwrap(), 3);
    }

    #[test]
    fn test_resolve_record() {
        let reg = Registry::from_json(FLOW_MAP).unwrap();
        let key = FlowKey::tcp(
            "10.0.0.5:51000".parse().unwrap(),
            "[2001:db8::1]:443".parse().unwrap(),
        );
        let rec = FlowRecord::start(key, "atlas".into(), Some("production".into()), Utc::now());
        assert_eq!(reg.resolve(&rec).unwrap(), (16, 14));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FLOW_MAP.as_bytes()).unwrap();
        let reg = Registry::load_file(file.path()).unwrap();
        assert_eq!(reg.resolve_experiment(&"cms".into()).unwrap(), 17);

        assert!(Registry::load_file("/nonexistent/flowmap.json").is_err());
        assert!(Registry::from_json("{}").is_err());
    }
}
