//! Resolve-and-connect: fetch → validate → dial.
//!
//! The three steps are supplied by the caller; [`DirectResolver`] only fixes
//! their order. A failed fetch never reaches validation, and a failed
//! validation never reaches the dialer, so no connection is opened for a
//! request the instance cannot serve.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::dial::{Dial, RawConn};
use crate::error::StatusError;
use crate::instance::Instance;

// ---------------------------------------------------------------------------
// Collaborator interfaces
// ---------------------------------------------------------------------------

/// Read access to the cluster datastore.
pub trait InstanceSource: Send + Sync {
    /// Look up an instance by namespace and name.
    fn fetch_instance<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Instance, StatusError>>;

    /// Look up the running instance of the VM `namespace/name`.
    fn fetch_instance_for_vm<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Instance, StatusError>>;
}

/// `fetch(namespace, name) -> Instance | NotFound | Internal`
pub type FetchFn =
    Arc<dyn Fn(&str, &str) -> BoxFuture<'static, Result<Instance, StatusError>> + Send + Sync>;

/// `validate(instance) -> () | BadRequest | Conflict`
pub type ValidateFn = Arc<dyn Fn(&Instance) -> Result<(), StatusError> + Send + Sync>;

/// Build a [`FetchFn`] from an async closure over owned names.
pub fn fetch_fn<F, Fut>(f: F) -> FetchFn
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Instance, StatusError>> + Send + 'static,
{
    Arc::new(
        move |namespace: &str, name: &str| -> BoxFuture<'static, Result<Instance, StatusError>> {
            Box::pin(f(namespace.to_owned(), name.to_owned()))
        },
    )
}

/// Build a [`ValidateFn`] from a plain predicate.
pub fn validate_fn<F>(f: F) -> ValidateFn
where
    F: Fn(&Instance) -> Result<(), StatusError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Fetch instances directly by name.
pub fn fetch_instance(source: Arc<dyn InstanceSource>) -> FetchFn {
    fetch_fn(move |namespace, name| {
        let source = Arc::clone(&source);
        async move { source.fetch_instance(&namespace, &name).await }
    })
}

/// Fetch the instance belonging to the named VM.
pub fn fetch_instance_for_vm(source: Arc<dyn InstanceSource>) -> FetchFn {
    fetch_fn(move |namespace, name| {
        let source = Arc::clone(&source);
        async move { source.fetch_instance_for_vm(&namespace, &name).await }
    })
}

// ---------------------------------------------------------------------------
// DirectResolver
// ---------------------------------------------------------------------------

/// Composes fetch, validate and dial into one resolve-and-connect step.
#[derive(Clone)]
pub struct DirectResolver {
    fetch: FetchFn,
    validate: ValidateFn,
    dial: Arc<dyn Dial>,
}

impl DirectResolver {
    pub fn new(fetch: FetchFn, validate: ValidateFn, dial: Arc<dyn Dial>) -> Self {
        Self {
            fetch,
            validate,
            dial,
        }
    }

    /// Fetch the instance and check it can serve the request.
    pub async fn fetch_and_validate(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Instance, StatusError> {
        let instance = (self.fetch)(namespace, name).await.inspect_err(|e| {
            warn!(namespace, name, error = %e, "Failed to gather vmi");
        })?;

        (self.validate)(&instance).inspect_err(|e| {
            debug!(namespace, name, error = %e, "vmi rejected by validation");
        })?;

        Ok(instance)
    }

    /// Open the server-side connection to an already validated instance.
    pub async fn dial(&self, instance: &Instance) -> Result<RawConn, StatusError> {
        self.dial.dial(instance).await
    }

    /// Fetch, validate and dial in one step.
    pub async fn resolve(&self, namespace: &str, name: &str) -> Result<RawConn, StatusError> {
        let instance = self.fetch_and_validate(namespace, name).await?;
        self.dial(&instance).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
