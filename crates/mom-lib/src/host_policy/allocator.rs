//! Allocators compute per-guest controls each cycle

use crate::monitor::Entity;
use crate::registry::Registry;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::warn;

/// Guest variable holding this cycle's inquiry answer
pub const INQUIRY_VAR: &str = "inquiry";

pub trait Allocator: Send {
    fn name(&self) -> &str;

    /// Set `controls` on the guests for the next cycle
    fn apply_policy(&mut self, host: &mut Entity, guests: &mut [Entity]) -> Result<()>;
}

/// Grants every guest exactly what it asked for in its inquiry
#[derive(Debug, Clone)]
pub struct InquiryAllocator {
    resources: BTreeSet<String>,
}

impl InquiryAllocator {
    pub fn new(resources: &[String]) -> Self {
        Self {
            resources: resources.iter().cloned().collect(),
        }
    }

    pub fn create(resources: &[String]) -> Result<Box<dyn Allocator>> {
        Ok(Box::new(Self::new(resources)))
    }
}

impl Allocator for InquiryAllocator {
    fn name(&self) -> &str {
        "InquiryAllocator"
    }

    fn apply_policy(&mut self, _host: &mut Entity, guests: &mut [Entity]) -> Result<()> {
        for guest in guests.iter_mut() {
            let inquiry = match guest.get_var(INQUIRY_VAR) {
                Some(Value::Object(inquiry)) => inquiry.clone(),
                _ => {
                    warn!(guest = %guest.name(), "No inquiry results for guest");
                    continue;
                }
            };

            for resource in &self.resources {
                let Some(value) = inquiry.get(resource) else {
                    continue;
                };
                let value = value.as_f64().with_context(|| {
                    format!(
                        "Inquiry of {} has a non-numeric {} value: {}",
                        guest.name(),
                        resource,
                        value
                    )
                })?;
                guest.control(resource.clone(), value);
            }
        }
        Ok(())
    }
}

pub type AllocatorFactory = fn(&[String]) -> Result<Box<dyn Allocator>>;

/// Allocator factories by name
#[derive(Clone)]
pub struct AllocatorRegistry {
    inner: Registry<AllocatorFactory>,
}

impl Default for AllocatorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl AllocatorRegistry {
    pub fn empty() -> Self {
        Self {
            inner: Registry::new("allocator"),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry
            .inner
            .insert("InquiryAllocator", InquiryAllocator::create as AllocatorFactory);
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: AllocatorFactory,
    ) -> Result<(), crate::error::RegistryError> {
        self.inner.register(name, factory)
    }

    pub fn create(&self, name: &str, resources: &[String]) -> Result<Box<dyn Allocator>> {
        let factory = self.inner.get(name)?;
        factory(resources).with_context(|| format!("Failed to create allocator {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Properties;
    use serde_json::json;

    fn guest(name: &str) -> Entity {
        Entity::detached(
            Properties {
                name: name.to_string(),
                ..Default::default()
            },
            Vec::new(),
        )
    }

    #[test]
    fn test_grants_inquired_resources() {
        let mut allocator = InquiryAllocator::new(&["memory".to_string()]);
        let mut host = guest("host");
        let mut guests = vec![guest("vm-1"), guest("vm-2")];
        guests[0].set_var(INQUIRY_VAR, json!({"memory": 2048.0, "cpu": 2.0}));
        guests[1].set_var(INQUIRY_VAR, Value::Null);

        allocator.apply_policy(&mut host, &mut guests).unwrap();

        assert_eq!(guests[0].get_control("memory"), Some(2048.0));
        // Only configured resources are controlled
        assert_eq!(guests[0].get_control("cpu"), None);
        assert!(guests[1].controls().is_empty());
    }

    #[test]
    fn test_non_numeric_inquiry_is_error() {
        let mut allocator = InquiryAllocator::new(&["memory".to_string()]);
        let mut guests = vec![guest("vm-1")];
        guests[0].set_var(INQUIRY_VAR, json!({"memory": "lots"}));

        assert!(allocator
            .apply_policy(&mut guest("host"), &mut guests)
            .is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = AllocatorRegistry::with_defaults();
        let resources = vec!["memory".to_string()];
        assert_eq!(
            registry
                .create("InquiryAllocator", &resources)
                .unwrap()
                .name(),
            "InquiryAllocator"
        );
        assert!(registry.create("Nope", &resources).is_err());
    }
}
