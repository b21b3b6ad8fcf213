//! Per-cycle snapshot of a monitor

use super::{lock_data, MonitorData, Properties};
use crate::communication::{Allocation, GuestClient};
use crate::error::EntityError;
use crate::record::{lookup, Record};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Variable holding the controls applied in the previous cycle
pub const LAST_CONTROL: &str = "last_control";

/// Snapshot of one monitored subject taken at the start of a cycle.
///
/// Properties and statistics are fixed for the lifetime of the snapshot.
/// Variables and controls are written by the policy and only reach the
/// owning monitor through [`Entity::store_variables`].
#[derive(Debug, Clone)]
pub struct Entity {
    properties: Properties,
    statistics: Vec<Record>,
    variables: Record,
    controls: Allocation,
    store: Arc<Mutex<MonitorData>>,
}

impl Entity {
    pub(crate) fn new(
        properties: Properties,
        statistics: Vec<Record>,
        variables: Record,
        store: Arc<Mutex<MonitorData>>,
    ) -> Self {
        Self {
            properties,
            statistics,
            variables,
            controls: Allocation::new(),
            store,
        }
    }

    /// A detached entity, for policies evaluated outside a running monitor
    pub fn detached(properties: Properties, statistics: Vec<Record>) -> Self {
        Self::new(
            properties,
            statistics,
            Record::new(),
            Arc::new(Mutex::new(MonitorData::default())),
        )
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    pub fn prop(&self) -> &Properties {
        &self.properties
    }

    pub fn guest_client(&self) -> Result<&GuestClient, EntityError> {
        self.properties
            .guest_client
            .as_ref()
            .ok_or_else(|| EntityError::NoGuestClient {
                entity: self.name().to_string(),
            })
    }

    pub fn statistics(&self) -> &[Record] {
        &self.statistics
    }

    /// Latest value of a statistic. Nested values are addressed with a
    /// dotted path such as `libvirt.curmem`.
    pub fn stat(&self, key: &str) -> Result<&Value, EntityError> {
        let latest = self
            .statistics
            .last()
            .ok_or_else(|| EntityError::EmptyHistory {
                entity: self.name().to_string(),
            })?;
        lookup(latest, key).ok_or_else(|| EntityError::MissingStatistic {
            entity: self.name().to_string(),
            key: key.to_string(),
        })
    }

    pub fn stat_f64(&self, key: &str) -> Result<f64, EntityError> {
        self.stat(key)?
            .as_f64()
            .ok_or_else(|| EntityError::NonNumeric {
                entity: self.name().to_string(),
                key: key.to_string(),
            })
    }

    /// Mean of a statistic over the whole history
    pub fn stat_avg(&self, key: &str) -> Result<f64, EntityError> {
        if self.statistics.is_empty() {
            return Err(EntityError::EmptyHistory {
                entity: self.name().to_string(),
            });
        }

        let mut sum = 0.0;
        for record in &self.statistics {
            let value = lookup(record, key).ok_or_else(|| EntityError::MissingStatistic {
                entity: self.name().to_string(),
                key: key.to_string(),
            })?;
            sum += value.as_f64().ok_or_else(|| EntityError::NonNumeric {
                entity: self.name().to_string(),
                key: key.to_string(),
            })?;
        }
        Ok(sum / self.statistics.len() as f64)
    }

    pub fn get_var(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(key.into(), value.into());
    }

    pub fn update_vars(&mut self, variables: Record) {
        self.variables.extend(variables);
    }

    pub fn variables(&self) -> &Record {
        &self.variables
    }

    /// Set the target of `resource` for this cycle
    pub fn control(&mut self, resource: impl Into<String>, value: f64) {
        self.controls.insert(resource.into(), value);
    }

    pub fn get_control(&self, resource: &str) -> Option<f64> {
        self.controls.get(resource).copied()
    }

    pub fn controls(&self) -> &Allocation {
        &self.controls
    }

    /// Controls committed at the end of the previous cycle
    pub fn last_control(&self) -> Allocation {
        self.variables
            .get(LAST_CONTROL)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    /// Commit variables, with `last_control` set to this cycle's controls,
    /// back to the owning monitor
    pub fn store_variables(&self) {
        let mut variables = self.variables.clone();
        variables.insert(
            LAST_CONTROL.to_string(),
            Value::Object(
                self.controls
                    .iter()
                    .map(|(resource, value)| (resource.clone(), Value::from(*value)))
                    .collect(),
            ),
        );
        lock_data(&self.store).variables.extend(variables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn entity(statistics: Vec<Record>) -> Entity {
        Entity::detached(
            Properties {
                name: "vm-1".to_string(),
                ..Default::default()
            },
            statistics,
        )
    }

    #[test]
    fn test_stat_reads_latest_sample() {
        let e = entity(vec![
            record(json!({"libvirt": {"curmem": 1024.0}})),
            record(json!({"libvirt": {"curmem": 2048.0}})),
        ]);
        assert_eq!(e.stat_f64("libvirt.curmem").unwrap(), 2048.0);
        assert!(matches!(
            e.stat("libvirt.maxmem"),
            Err(EntityError::MissingStatistic { .. })
        ));
    }

    #[test]
    fn test_stat_avg() {
        let e = entity(vec![
            record(json!({"free": 10})),
            record(json!({"free": 20})),
            record(json!({"free": 60})),
        ]);
        assert_eq!(e.stat_avg("free").unwrap(), 30.0);
    }

    #[test]
    fn test_stat_avg_errors() {
        assert!(matches!(
            entity(vec![]).stat_avg("free"),
            Err(EntityError::EmptyHistory { .. })
        ));
        assert!(matches!(
            entity(vec![record(json!({"free": "lots"}))]).stat_avg("free"),
            Err(EntityError::NonNumeric { .. })
        ));
    }

    #[test]
    fn test_store_variables_commits_controls() {
        let mut e = entity(vec![]);
        e.set_var("inquiry", json!({"memory": 512.0}));
        e.control("memory", 512.0);
        e.store_variables();

        let stored = lock_data(&e.store).variables.clone();
        assert_eq!(stored["inquiry"], json!({"memory": 512.0}));
        assert_eq!(stored[LAST_CONTROL], json!({"memory": 512.0}));
    }

    #[test]
    fn test_uncommitted_variables_are_not_visible() {
        let mut e = entity(vec![]);
        e.set_var("scratch", 1);
        assert!(lock_data(&e.store).variables.is_empty());
    }
}
