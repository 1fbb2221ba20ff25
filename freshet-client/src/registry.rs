//! Consumer registration table.
//!
//! Each consumer owns one slot holding its current declaration list.
//! Re-registering replaces the whole list; registering nothing removes
//! the slot. Aggregate requirements are a pure view derived from all
//! slots.

use freshet_core::{
    merge, ConsumerId, FreshetResult, RegistryError, RequirementDeclaration, Requirements,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct ConsumerRegistry {
    slots: BTreeMap<ConsumerId, Vec<RequirementDeclaration>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a consumer's declarations, returning the previous list.
    ///
    /// `None` or an empty list removes the consumer.
    pub fn replace(
        &mut self,
        consumer: ConsumerId,
        declarations: Option<Vec<RequirementDeclaration>>,
    ) -> Option<Vec<RequirementDeclaration>> {
        match declarations {
            Some(declarations) if !declarations.is_empty() => {
                self.slots.insert(consumer, declarations)
            }
            _ => self.slots.remove(&consumer),
        }
    }

    pub fn get(&self, consumer: ConsumerId) -> FreshetResult<&[RequirementDeclaration]> {
        self.slots
            .get(&consumer)
            .map(Vec::as_slice)
            .ok_or_else(|| RegistryError::UnknownConsumer { consumer }.into())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn declarations(&self) -> impl Iterator<Item = &RequirementDeclaration> {
        self.slots.values().flatten()
    }

    /// Aggregate requirements across every registered consumer.
    pub fn requirements(&self) -> Requirements {
        merge(self.declarations())
    }
}
