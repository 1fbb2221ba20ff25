//! Selector sessions.
//!
//! A consumer reads through a [`ConsumerSession`]. Every resource a
//! selector asks for with [`SelectorContext::require_data`] is declared on
//! the consumer's behalf; committing the session replaces the consumer's
//! registration with exactly what was declared during it.

use freshet_core::{ClientState, ConsumerId, FreshetResult, RequirementDeclaration, ResourceName};
use serde_json::Value;
use std::sync::Arc;

use crate::api::Demand;
use crate::client::Client;

/// Read access handed to a selector.
pub struct SelectorContext<'a> {
    state: &'a ClientState,
    collected: &'a mut Vec<RequirementDeclaration>,
}

impl<'a> SelectorContext<'a> {
    pub(crate) fn new(state: &'a ClientState, collected: &'a mut Vec<RequirementDeclaration>) -> Self {
        Self { state, collected }
    }

    /// Current data for `resource`, without declaring anything.
    pub fn get_data(&self, resource: &str) -> Option<Value> {
        self.state.data(resource).cloned()
    }

    /// Declare `demand` for `resource` and return its current data.
    pub fn require_data(&mut self, resource: impl Into<ResourceName>, demand: &Demand) -> Option<Value> {
        let declaration = demand.declare(resource);
        let data = self.state.data(declaration.resource.as_str()).cloned();
        self.collected.push(declaration);
        data
    }

    pub fn state(&self) -> &ClientState {
        self.state
    }
}

/// Declarations collected for one consumer across selector calls.
pub struct ConsumerSession<'a> {
    client: &'a Client,
    consumer: ConsumerId,
    state: Arc<ClientState>,
    collected: Vec<RequirementDeclaration>,
}

impl<'a> ConsumerSession<'a> {
    pub(crate) fn new(client: &'a Client, consumer: ConsumerId) -> Self {
        Self {
            client,
            consumer,
            state: client.state(),
            collected: Vec::new(),
        }
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Run the selector `name` against the session's snapshot.
    pub fn select(&mut self, name: &str, demand: &Demand, args: &Value) -> FreshetResult<Value> {
        let selector = self.client.api().selector(name)?;
        let mut ctx = SelectorContext::new(&self.state, &mut self.collected);
        Ok(selector.select(&mut ctx, demand, args))
    }

    /// Declare `demand` for `resource` directly and return its current data.
    pub fn require(&mut self, declaration: RequirementDeclaration) -> Option<Value> {
        let data = self.state.data(declaration.resource.as_str()).cloned();
        self.collected.push(declaration);
        data
    }

    pub fn declarations(&self) -> &[RequirementDeclaration] {
        &self.collected
    }

    /// Register everything collected, replacing the consumer's previous
    /// declarations. A session that declared nothing removes the consumer.
    ///
    /// Returns whether the aggregate requirements changed.
    pub fn commit(self) -> bool {
        let declarations = if self.collected.is_empty() {
            None
        } else {
            Some(self.collected)
        };
        self.client.register(self.consumer, declarations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Api, BoundMethods, PendingValue};
    use freshet_core::{ConfigError, FreshetError, ResourceState};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn thing_selector(ctx: &mut SelectorContext<'_>, demand: &Demand, args: &Value) -> Value {
        let id = args["id"].as_u64().unwrap_or_default();
        ctx.require_data(format!("thing:{}", id), demand)
            .unwrap_or(Value::Null)
    }

    fn api() -> Arc<Api> {
        Arc::new(
            Api::builder()
                .read(|_: &BoundMethods, _: &[ResourceName], _: Option<&Value>| {
                    BTreeMap::<ResourceName, PendingValue>::new()
                })
                .selector("thing", thing_selector)
                .build(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_declares_and_reads() {
        let mut state = ClientState::new();
        state.insert(
            "thing:1".into(),
            ResourceState {
                data: Some(json!({ "name": "one" })),
                ..ResourceState::default()
            },
        );
        let client = Client::builder(api(), "k").state(state).build().unwrap();
        let consumer = client.add_consumer();

        let mut session = client.session(consumer);
        let demand = Demand::fresh_within(Duration::from_secs(90));
        let value = session.select("thing", &demand, &json!({ "id": 1 })).unwrap();
        assert_eq!(value["name"], "one");
        let missing = session.select("thing", &demand, &json!({ "id": 2 })).unwrap();
        assert!(missing.is_null());

        assert_eq!(session.declarations().len(), 2);
        assert!(session.commit());

        let requirements = client.requirements();
        assert_eq!(requirements["thing:1"].freshness, Duration::from_secs(90));
        assert!(requirements.contains_key("thing:2"));
        assert_eq!(client.declarations_of(consumer).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_session_removes_consumer() {
        let client = Client::builder(api(), "k").build().unwrap();
        let consumer = client.add_consumer();
        client.register(consumer, Some(vec![RequirementDeclaration::new("a")]));

        assert!(client.session(consumer).commit());
        assert!(client.requirements().is_empty());
        assert!(client.declarations_of(consumer).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_selector() {
        let client = Client::builder(api(), "k").build().unwrap();
        let mut session = client.session(client.add_consumer());
        let err = session
            .select("missing", &Demand::new(), &Value::Null)
            .unwrap_err();
        assert!(matches!(err, FreshetError::Config(ConfigError::UnknownSelector { .. })));
    }
}
