//! Name → factory registries for pluggable components

use crate::error::RegistryError;
use std::collections::BTreeMap;

/// Factories of one plugin kind, looked up by configured name
#[derive(Debug, Clone)]
pub struct Registry<F> {
    kind: &'static str,
    factories: BTreeMap<String, F>,
}

impl<F: Copy> Registry<F> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: F) -> Result<(), RegistryError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::Duplicate {
                kind: self.kind,
                name,
            });
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Register or replace a factory
    pub fn insert(&mut self, name: impl Into<String>, factory: F) {
        self.factories.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> Result<F, RegistryError> {
        self.factories
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::Unknown {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one() -> u32 {
        1
    }

    fn two() -> u32 {
        2
    }

    #[test]
    fn test_register_and_get() {
        let mut registry: Registry<fn() -> u32> = Registry::new("number");
        registry.register("one", one).unwrap();
        registry.register("two", two).unwrap();

        assert_eq!(registry.get("two").unwrap()(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["one", "two"]);
    }

    #[test]
    fn test_unknown_and_duplicate() {
        let mut registry: Registry<fn() -> u32> = Registry::new("number");
        registry.register("one", one).unwrap();

        assert_eq!(
            registry.register("one", two),
            Err(RegistryError::Duplicate {
                kind: "number",
                name: "one".to_string()
            })
        );
        assert_eq!(
            registry.get("three").unwrap_err().to_string(),
            "Unknown number 'three'"
        );
    }
}
