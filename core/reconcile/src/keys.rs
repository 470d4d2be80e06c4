//! Single key resource (`etcd_keys`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use etcdform_common::{Error, KeyPath, Result};
use etcdform_store::keys::codes;
use etcdform_store::{GetOptions, KeysApi, Node};

use crate::plan::{Applied, Operation, Plan};
use crate::resource::Resource;

pub const TYPE_NAME: &str = "etcd_keys";

/// Desired state of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    pub path: String,
    pub value: String,
    /// Time to live in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Replace an existing key on create instead of failing.
    #[serde(default)]
    pub overwrite: bool,
}

impl KeyConfig {
    pub fn new(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
            ttl: None,
            overwrite: false,
        }
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Observed state of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    pub path: KeyPath,
    pub value: String,
    /// Remaining time to live, if the key expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Modified index of the key.
    pub version: u64,
}

impl KeyState {
    fn from_node(path: &KeyPath, node: &Node) -> Result<Self> {
        if node.dir {
            return Err(Error::Store {
                code: codes::NOT_FILE,
                message: "Not a file".to_string(),
                cause: path.to_string(),
            });
        }
        Ok(Self {
            path: path.clone(),
            value: node.value.clone().unwrap_or_default(),
            ttl: node.ttl.and_then(|t| u64::try_from(t).ok()),
            version: node.modified_index,
        })
    }
}

/// Reconciler for single keys.
pub struct KeyResource {
    store: Arc<dyn KeysApi>,
}

impl KeyResource {
    pub fn new(store: Arc<dyn KeysApi>) -> Self {
        Self { store }
    }

    async fn apply(&self, plan: Plan) -> Result<Vec<Applied>> {
        plan.execute(self.store.as_ref()).await.into_result()
    }

    fn state_from(path: &KeyPath, applied: &[Applied]) -> Result<KeyState> {
        let node = applied
            .iter()
            .rev()
            .find_map(|a| a.node.as_ref())
            .ok_or_else(|| Error::InvalidInput(format!("{}: store returned no node", path)))?;
        KeyState::from_node(path, node)
    }
}

#[async_trait]
impl Resource for KeyResource {
    type Config = KeyConfig;
    type State = KeyState;

    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn path(&self, config: &KeyConfig) -> Result<KeyPath> {
        let path = KeyPath::parse(&config.path)?;
        if path.is_root() {
            return Err(Error::InvalidInput(
                "the root directory cannot be managed as a key".to_string(),
            ));
        }
        if config.ttl == Some(0) {
            return Err(Error::InvalidInput(format!(
                "{}: ttl must be at least one second",
                path
            )));
        }
        Ok(path)
    }

    fn plan(&self, observed: Option<&KeyState>, desired: Option<&KeyConfig>) -> Result<Plan> {
        let path = match (desired, observed) {
            (Some(config), _) => self.path(config)?,
            (None, Some(state)) => state.path.clone(),
            (None, None) => return Err(Error::InvalidInput("nothing to plan".to_string())),
        };
        let mut plan = Plan::new(TYPE_NAME, path.clone());

        match (observed, desired) {
            (None, Some(config)) => plan.push(Operation::CreateKey {
                path,
                value: config.value.clone(),
                ttl: config.ttl,
                overwrite: config.overwrite,
            }),
            (Some(state), Some(config)) => {
                if state.path != path {
                    return Err(Error::InvalidInput(format!(
                        "{}: state belongs to {}",
                        path, state.path
                    )));
                }
                // The store reports the remaining TTL, so only its presence
                // can be compared.
                if state.value != config.value || state.ttl.is_some() != config.ttl.is_some() {
                    plan.push(Operation::UpdateKey {
                        path,
                        value: config.value.clone(),
                        ttl: config.ttl,
                        version: state.version,
                    });
                }
            }
            (Some(state), None) => plan.push(Operation::DeleteKey {
                path,
                version: state.version,
            }),
            (None, None) => {}
        }

        Ok(plan)
    }

    fn overwrites_existing(&self, config: &KeyConfig) -> bool {
        config.overwrite
    }

    async fn read(&self, path: &KeyPath) -> Result<Option<KeyState>> {
        let response = self.store.try_get(path, &GetOptions::default()).await?;
        response
            .map(|r| KeyState::from_node(path, &r.node))
            .transpose()
    }

    async fn create(&self, config: &KeyConfig) -> Result<KeyState> {
        let path = self.path(config)?;
        let applied = self.apply(self.plan(None, Some(config))?).await?;
        let state = Self::state_from(&path, &applied)?;
        info!(path = %path, version = state.version, "key created");
        Ok(state)
    }

    async fn update(&self, prior: &KeyState, config: &KeyConfig) -> Result<KeyState> {
        let plan = self.plan(Some(prior), Some(config))?;
        if plan.is_empty() {
            return Ok(prior.clone());
        }
        let applied = self.apply(plan).await?;
        let state = Self::state_from(&prior.path, &applied)?;
        info!(path = %prior.path, version = state.version, "key updated");
        Ok(state)
    }

    async fn delete(&self, prior: &KeyState) -> Result<()> {
        self.apply(self.plan(Some(prior), None)?).await?;
        info!(path = %prior.path, "key deleted");
        Ok(())
    }
}
