//! Request and response interceptors.
//!
//! An interceptor sees every sync call for its dataset and may veto it,
//! typically to authenticate the client from its `meta_data`. A vetoed
//! request has no side effects.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// What an interceptor gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct InterceptContext<'a> {
    /// Dataset id.
    pub dataset_id: &'a str,
    /// Client query parameters.
    pub query_params: &'a Value,
    /// Client meta data.
    pub meta_data: &'a Value,
    /// Client connection id, when known.
    pub cuid: Option<&'a str>,
}

/// A check run before or after a sync call.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Returns `Err(reason)` to reject the call.
    async fn intercept(&self, context: &InterceptContext<'_>) -> Result<(), String>;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl Interceptor for PassThrough {
    async fn intercept(&self, _context: &InterceptContext<'_>) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Default)]
struct Slot {
    global: Option<Arc<dyn Interceptor>>,
    datasets: HashMap<String, Arc<dyn Interceptor>>,
}

impl Slot {
    fn resolve(&self, dataset_id: &str) -> Option<Arc<dyn Interceptor>> {
        self.datasets
            .get(dataset_id)
            .or(self.global.as_ref())
            .cloned()
    }
}

/// Request and response interceptors, global and per dataset.
///
/// A dataset's own interceptor replaces the global one.
#[derive(Default)]
pub struct Interceptors {
    request: RwLock<Slot>,
    response: RwLock<Slot>,
}

impl Interceptors {
    /// Creates a registry that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request interceptor used by datasets without their own.
    pub fn set_global_request(&self, interceptor: Arc<dyn Interceptor>) {
        self.request.write().global = Some(interceptor);
    }

    /// Sets the response interceptor used by datasets without their own.
    pub fn set_global_response(&self, interceptor: Arc<dyn Interceptor>) {
        self.response.write().global = Some(interceptor);
    }

    /// Sets a dataset's request interceptor.
    pub fn set_request(&self, dataset_id: impl Into<String>, interceptor: Arc<dyn Interceptor>) {
        self.request.write().datasets.insert(dataset_id.into(), interceptor);
    }

    /// Sets a dataset's response interceptor.
    pub fn set_response(&self, dataset_id: impl Into<String>, interceptor: Arc<dyn Interceptor>) {
        self.response.write().datasets.insert(dataset_id.into(), interceptor);
    }

    /// Runs the request interceptor for the context's dataset.
    pub async fn intercept_request(&self, context: &InterceptContext<'_>) -> Result<(), String> {
        let interceptor = self.request.read().resolve(context.dataset_id);
        match interceptor {
            Some(interceptor) => interceptor.intercept(context).await,
            None => Ok(()),
        }
    }

    /// Runs the response interceptor for the context's dataset.
    pub async fn intercept_response(&self, context: &InterceptContext<'_>) -> Result<(), String> {
        let interceptor = self.response.read().resolve(context.dataset_id);
        match interceptor {
            Some(interceptor) => interceptor.intercept(context).await,
            None => Ok(()),
        }
    }

    /// Removes every registered interceptor.
    pub fn restore(&self) {
        *self.request.write() = Slot::default();
        *self.response.write() = Slot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Rejects clients whose meta data lacks a token.
    struct RequireToken;

    #[async_trait]
    impl Interceptor for RequireToken {
        async fn intercept(&self, context: &InterceptContext<'_>) -> Result<(), String> {
            match context.meta_data.get("token") {
                Some(_) => Ok(()),
                None => Err(format!("no token for {}", context.dataset_id)),
            }
        }
    }

    static NO_QUERY: Value = Value::Null;

    fn context<'a>(dataset_id: &'a str, meta_data: &'a Value) -> InterceptContext<'a> {
        InterceptContext {
            dataset_id,
            query_params: &NO_QUERY,
            meta_data,
            cuid: Some("c1"),
        }
    }

    #[tokio::test]
    async fn default_accepts() {
        let interceptors = Interceptors::new();
        let md = json!({});
        assert!(interceptors.intercept_request(&context("todos", &md)).await.is_ok());
        assert!(interceptors.intercept_response(&context("todos", &md)).await.is_ok());
        assert!(PassThrough.intercept(&context("todos", &md)).await.is_ok());
    }

    #[tokio::test]
    async fn dataset_overrides_global() {
        let interceptors = Interceptors::new();
        interceptors.set_global_request(Arc::new(RequireToken));
        interceptors.set_request("public", Arc::new(PassThrough));

        let anonymous = json!({});
        let err = interceptors
            .intercept_request(&context("todos", &anonymous))
            .await
            .unwrap_err();
        assert_eq!(err, "no token for todos");
        assert!(interceptors.intercept_request(&context("public", &anonymous)).await.is_ok());
        assert!(interceptors
            .intercept_request(&context("todos", &json!({"token": "t"})))
            .await
            .is_ok());
        // Response side is independent.
        assert!(interceptors.intercept_response(&context("todos", &anonymous)).await.is_ok());

        interceptors.restore();
        assert!(interceptors.intercept_request(&context("todos", &anonymous)).await.is_ok());
    }
}
