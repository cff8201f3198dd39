//! Worker runtime
//!
//! [`Engine`] turns a [`CompiledModel`] into running consumers: one
//! splitter role per input report, one generator role per artificial
//! field, one resolver role per output report. Each role is realized by N
//! worker tasks sharing the role's consumer group, so roles scale
//! horizontally without coordination beyond the broker.

use crate::broker::Broker;
use crate::consumer::{run_consumer, ConsumerOptions, StreamConsumer};
use crate::generator::{FieldGenerator, GeneratorOptions};
use crate::model::CompiledModel;
use crate::resolver::DependencyResolver;
use crate::splitter::Splitter;
use brook_core::{BrookSchema, DEFAULT_WORKERS, DEFAULT_WORKERS_ENV};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Engine tuning. `default_workers` honors the `DEFAULT_WORKERS`
/// environment variable; individual roles can be overridden by consumer
/// group name.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_workers: usize,
    pub workers: HashMap<String, usize>,
    pub consumer: ConsumerOptions,
    pub generator: GeneratorOptions,
    /// TTL on splitter idempotency markers.
    pub marker_ttl: Duration,
    /// TTL on resolver pending state.
    pub pending_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_workers: DEFAULT_WORKERS,
            workers: HashMap::new(),
            consumer: ConsumerOptions::default(),
            generator: GeneratorOptions::default(),
            marker_ttl: Duration::from_secs(3600),
            pending_ttl: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    /// Defaults with `DEFAULT_WORKERS` applied from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = std::env::var(DEFAULT_WORKERS_ENV)
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            config.default_workers = workers;
        }
        config
    }

    /// Override the worker count of one role (by consumer group name).
    pub fn with_workers(mut self, group: &str, workers: usize) -> Self {
        self.workers.insert(group.to_string(), workers);
        self
    }

    fn workers_for(&self, group: &str) -> usize {
        self.workers
            .get(group)
            .copied()
            .unwrap_or(self.default_workers)
            .max(1)
    }
}

/// A compiled model bound to a broker, ready to run workers.
pub struct Engine {
    model: CompiledModel,
    broker: Arc<dyn Broker>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(model: CompiledModel, broker: Arc<dyn Broker>, config: EngineConfig) -> Self {
        Self {
            model,
            broker,
            config,
        }
    }

    pub fn schema(&self) -> &BrookSchema {
        &self.model.schema
    }

    pub fn model(&self) -> &CompiledModel {
        &self.model
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    /// Run all roles until `shutdown` flips to true, then drain and return.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let sep = self.model.special_char;
        let mut roles: Vec<(String, Arc<dyn StreamConsumer>)> = Vec::new();

        for spec in &self.model.splitters {
            roles.push((
                spec.group.clone(),
                Arc::new(Splitter::new(
                    spec.clone(),
                    self.broker.clone(),
                    sep,
                    self.config.marker_ttl,
                )),
            ));
        }
        for spec in &self.model.generators {
            roles.push((
                spec.group.clone(),
                Arc::new(FieldGenerator::new(
                    spec.clone(),
                    self.broker.clone(),
                    sep,
                    self.config.generator.clone(),
                )),
            ));
        }
        for spec in &self.model.resolvers {
            roles.push((
                spec.group.clone(),
                Arc::new(DependencyResolver::new(
                    spec.clone(),
                    self.broker.clone(),
                    sep,
                    self.config.pending_ttl,
                )),
            ));
        }

        let mut handles = Vec::new();
        for (group, consumer) in roles {
            let workers = self.config.workers_for(&group);
            info!("spawning {} workers for {}", workers, group);
            for _ in 0..workers {
                handles.push(tokio::spawn(run_consumer(
                    self.broker.clone(),
                    consumer.clone(),
                    self.config.consumer.clone(),
                    shutdown.clone(),
                )));
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("worker task failed: {}", e);
            }
        }
        info!("engine stopped");
    }
}
