//! Versioned registries for orchestrations and activities.
//!
//! `Registry<H>` stores handlers keyed by name and semver version. Activities
//! are always registered at 1.0.0 and resolved with the `Latest` policy;
//! orchestrations may register several versions and pin one with `Exact`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use semver::Version;

use super::{ActivityContext, ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::{OrchestrationContext, OrchestrationError, codec};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

type VersionMap<H> = HashMap<String, BTreeMap<Version, Arc<H>>>;

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<VersionMap<H>>,
    pub(crate) policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

// H: ?Sized rules out derive(Clone)
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: VersionMap<H>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    fn current_policy(&self, name: &str) -> VersionPolicy {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest)
    }

    /// Resolve a handler through the name's version policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let pol = self.current_policy(name);
        let result = match &pol {
            VersionPolicy::Latest => self
                .inner
                .get(name)
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => self
                .inner
                .get(name)
                .and_then(|versions| versions.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };
        if result.is_none() {
            self.log_registry_miss(name, None, Some(&pol));
        }
        result
    }

    /// Resolve the handler for an exact version, as recorded in history.
    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|versions| versions.get(v)).cloned();
        if result.is_none() {
            self.log_registry_miss(name, Some(v), None);
        }
        result
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str, requested_version: Option<&Version>, requested_policy: Option<&VersionPolicy>) {
        tracing::debug!(
            target: "ordo::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?requested_policy,
            available_versions_for_name = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build the registry, or return every registration error joined by "; ".
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn check_duplicate(&mut self, name: &str, version: &Version, error_prefix: &str) -> bool {
        let duplicate = self.map.get(name).is_some_and(|m| m.contains_key(version));
        if duplicate {
            self.errors
                .push(format!("duplicate {error_prefix} registration: {name}@{version}"));
        }
        duplicate
    }

    fn insert(&mut self, name: String, version: Version, handler: Arc<H>) {
        self.map.entry(name).or_default().insert(version, handler);
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, OrchestrationError>> + Send + 'static,
    {
        self.register_handler(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(f)))
    }

    /// Register under an explicit semver version. Versions of one name must be
    /// registered in increasing order.
    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, OrchestrationError>> + Send + 'static,
    {
        let name = name.into();
        let v = match Version::parse(version.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                self.errors
                    .push(format!("invalid version '{}' for orchestration {name}: {e}", version.as_ref()));
                return self;
            }
        };
        if let Some((latest, _)) = self.map.get(&name).and_then(|m| m.iter().next_back())
            && &v < latest
        {
            self.errors.push(format!(
                "non-monotonic orchestration version for {name}: {v} is not later than existing latest {latest}"
            ));
            return self;
        }
        self.register_handler(name, v, Arc::new(FnOrchestration(f)))
    }

    /// Register a handler with JSON-typed input and output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, OrchestrationError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = codec::decode(&input_s).map_err(|e| OrchestrationError::application(format!("decode input: {e}")))?;
                let out: Out = f(ctx, input).await?;
                codec::encode(&out).map_err(|e| OrchestrationError::application(format!("encode output: {e}")))
            }
        };
        self.register(name, wrapper)
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }

    fn register_handler(mut self, name: String, version: Version, handler: Arc<dyn OrchestrationHandler>) -> Self {
        if self.check_duplicate(&name, &version, "orchestration") {
            return self;
        }
        self.insert(name, version, handler);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        if self.check_duplicate(&name, &DEFAULT_VERSION, "activity") {
            return self;
        }
        self.insert(name.clone(), DEFAULT_VERSION, Arc::new(FnActivity(f)));
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = codec::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                codec::encode(&out)
            }
        };
        self.register(name, wrapper)
    }
}
