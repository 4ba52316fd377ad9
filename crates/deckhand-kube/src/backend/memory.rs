//! In-memory secret backend for testing
//!
//! Behaves like the API server for the subset the store relies on:
//! create-only inserts, resource versions, conditional replace and label
//! selectors. Faults can be queued per operation to simulate races,
//! server errors and slow calls.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{SecretBackend, secret_key};
use crate::error::{KubeError, Result};

const KIND: &str = "Secret";

/// Backend operation, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Get,
    List,
    Replace,
    Delete,
}

/// A failure to inject into the next call of an operation
#[derive(Debug, Clone)]
pub enum Fault {
    /// Answer with an API error carrying this HTTP status
    Status(u16),
    /// Stall before answering
    Delay(Duration),
    /// Store a competing secret right before the call runs
    Preempt(Box<Secret>),
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub creates: usize,
    pub gets: usize,
    pub lists: usize,
    pub replaces: usize,
    pub deletes: usize,
}

#[derive(Default)]
struct State {
    /// (namespace, name) -> secret
    secrets: BTreeMap<(String, String), Secret>,
    next_resource_version: u64,
    counts: OperationCounts,
    faults: HashMap<Operation, VecDeque<Fault>>,
}

impl State {
    fn insert(&mut self, mut secret: Secret) -> Secret {
        self.next_resource_version += 1;
        secret.metadata.resource_version = Some(self.next_resource_version.to_string());
        if secret.metadata.creation_timestamp.is_none() {
            secret.metadata.creation_timestamp = Some(Time(Utc::now()));
        }
        self.secrets.insert(secret_key(&secret), secret.clone());
        secret
    }
}

/// In-memory backend, clones share the same state
#[derive(Clone, Default)]
pub struct MemorySecretBackend {
    state: Arc<Mutex<State>>,
}

impl MemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-populated secrets
    pub fn with_secrets(secrets: Vec<Secret>) -> Self {
        let backend = Self::new();
        {
            let mut state = backend.lock();
            for secret in secrets {
                state.insert(secret);
            }
        }
        backend
    }

    /// Queue a fault for the next call of `operation`
    pub fn inject(&self, operation: Operation, fault: Fault) {
        self.lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.lock().counts.clone()
    }

    /// Names of all secrets in a namespace, sorted
    pub fn names(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .secrets
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn secret_count(&self) -> usize {
        self.lock().secrets.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and apply any queued fault
    async fn enter(&self, operation: Operation, namespace: &str, name: &str) -> Result<()> {
        let fault = {
            let mut state = self.lock();
            let counts = &mut state.counts;
            match operation {
                Operation::Create => counts.creates += 1,
                Operation::Get => counts.gets += 1,
                Operation::List => counts.lists += 1,
                Operation::Replace => counts.replaces += 1,
                Operation::Delete => counts.deletes += 1,
            }
            state
                .faults
                .get_mut(&operation)
                .and_then(|queue| queue.pop_front())
        };

        match fault {
            None => Ok(()),
            Some(Fault::Status(code)) => Err(KubeError::from_api(
                status_error(code),
                operation_name(operation),
                KIND,
                namespace,
                name,
            )),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(Fault::Preempt(secret)) => {
                self.lock().insert(*secret);
                Ok(())
            }
        }
    }
}

/// Build the API error the server would return for `code`
pub(crate) fn status_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected status {}", code),
        reason: String::new(),
        code,
    })
}

fn operation_name(operation: Operation) -> &'static str {
    match operation {
        Operation::Create => "create",
        Operation::Get => "get",
        Operation::List => "list",
        Operation::Replace => "replace",
        Operation::Delete => "delete",
    }
}

/// Minimal label selector support: `key=value`, `key!=value` and `key`
fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                labels.get(key.trim()).map(String::as_str) != Some(value.trim())
            } else if let Some((key, value)) = term.split_once('=') {
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    async fn create(&self, secret: &Secret) -> Result<Secret> {
        let (namespace, name) = secret_key(secret);
        self.enter(Operation::Create, &namespace, &name).await?;

        let mut state = self.lock();
        if state.secrets.contains_key(&(namespace.clone(), name.clone())) {
            return Err(KubeError::Conflict {
                name,
                reason: "already exists".to_string(),
            });
        }

        let mut secret = secret.clone();
        secret.metadata.resource_version = None;
        secret.metadata.creation_timestamp = None;
        Ok(state.insert(secret))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.enter(Operation::Get, namespace, name).await?;

        self.lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| KubeError::not_found(KIND, namespace, name))
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>> {
        self.enter(Operation::List, namespace, label_selector).await?;

        Ok(self
            .lock()
            .secrets
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, s)| matches_selector(s.metadata.labels.as_ref(), label_selector))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn replace(&self, secret: &Secret) -> Result<Secret> {
        let (namespace, name) = secret_key(secret);
        self.enter(Operation::Replace, &namespace, &name).await?;

        let mut state = self.lock();
        let existing = state
            .secrets
            .get(&(namespace.clone(), name.clone()))
            .ok_or_else(|| KubeError::not_found(KIND, &namespace, &name))?;

        if let Some(expected) = &secret.metadata.resource_version {
            if existing.metadata.resource_version.as_ref() != Some(expected) {
                return Err(KubeError::Conflict {
                    name,
                    reason: "the object has been modified".to_string(),
                });
            }
        }

        let mut secret = secret.clone();
        secret.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        Ok(state.insert(secret))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.enter(Operation::Delete, namespace, name).await?;

        self.lock()
            .secrets
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| KubeError::not_found(KIND, namespace, name))
    }
}
