//! Optional input preprocessor: a boxed transformer that normalizes or
//! reshapes raw signals before they reach the network. Modeled as a trait
//! object rather than a dynamic pipeline language.

use std::collections::BTreeMap;

use crate::spec::SignalSpecMap;
use crate::tensor::Tensor;

pub trait Processor: Send {
    fn apply(&self, signals: &BTreeMap<String, Tensor>) -> BTreeMap<String, Tensor>;
    fn spec(&self) -> SignalSpecMap;
    fn json(&self) -> serde_json::Value;
}

/// The identity processor used when the agent is configured without one.
pub struct IdentityProcessor {
    spec: SignalSpecMap,
}

impl IdentityProcessor {
    pub fn new(spec: SignalSpecMap) -> Self {
        Self { spec }
    }
}

impl Processor for IdentityProcessor {
    fn apply(&self, signals: &BTreeMap<String, Tensor>) -> BTreeMap<String, Tensor> {
        signals.clone()
    }

    fn spec(&self) -> SignalSpecMap {
        self.spec.clone()
    }

    fn json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "identity" })
    }
}
