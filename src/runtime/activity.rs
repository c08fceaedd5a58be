use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

/// Classified failure returned by an activity handler.
///
/// Transient errors (network, timeout, 5xx-equivalent) are retried by the
/// executor; permanent errors are recorded immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityError {
    pub message: String,
    pub retryable: bool,
}

impl ActivityError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn to_error_details(&self) -> crate::ErrorDetails {
        if self.retryable {
            crate::ErrorDetails::TransientActivity {
                message: self.message.clone(),
            }
        } else {
            crate::ErrorDetails::PermanentActivity {
                message: self.message.clone(),
            }
        }
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let class = if self.retryable { "transient" } else { "permanent" };
        write!(f, "{class}: {}", self.message)
    }
}

impl std::error::Error for ActivityError {}

/// Plain string errors from handlers are treated as permanent.
impl From<String> for ActivityError {
    fn from(s: String) -> Self {
        Self::permanent(s)
    }
}

impl From<&str> for ActivityError {
    fn from(s: &str) -> Self {
        Self::permanent(s)
    }
}

/// Trait implemented by activity handlers that can be invoked through the gateway.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}

/// The activity gateway: an immutable map from activity name to handler.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

impl ActivityRegistry {
    /// Create a new builder for registering activities.
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke `name` with `input`. Unknown names fail permanently.
    pub async fn invoke(&self, name: &str, input: String) -> Result<String, ActivityError> {
        match self.get(name) {
            Some(handler) => handler.invoke(input).await,
            None => Err(ActivityError::permanent(format!("unregistered:{name}"))),
        }
    }
}

/// Builder for `ActivityRegistry`.
pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistryBuilder {
    /// Initialize a new builder from an existing registry.
    pub fn from_registry(reg: &ActivityRegistry) -> Self {
        let map = reg.inner.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        ActivityRegistryBuilder { map }
    }

    /// Register a handler that cannot fail.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = String> + Send + 'static,
    {
        self.map.insert(
            name.into(),
            Arc::new(FnActivity(move |input: String| {
                let fut = f(input);
                async move { Ok::<String, ActivityError>(fut.await) }
            })),
        );
        self
    }

    /// Register a handler returning a classified result.
    pub fn register_result<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }

    /// Register an already-built handler.
    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) -> Self {
        self.map.insert(name.into(), handler);
        self
    }

    /// Finalize and produce an `ActivityRegistry`.
    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}
