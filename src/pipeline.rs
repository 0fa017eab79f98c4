//! Wiring of the distributor and its workers
//!
//! One channel and one worker task per configured plugin. The caller feeds
//! decoded flows in with [`Pipeline::dispatch`]; workers run until their
//! channel is closed.

use crate::channel::{ChannelId, ChannelRegistry, DecodedFlow, Dispatch, Distributor};
use crate::config::{Config, PluginConfig};
use crate::metrics::MetricsCollector;
use anyhow::{Context, Result};
use flowacct_worker::backend::Backend;
use flowacct_worker::writer::PurgeWriter;
use flowacct_worker::{Worker, WorkerSummary};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A worker task that finished.
#[derive(Debug)]
pub struct WorkerExit {
    pub channel: ChannelId,
    pub name: String,
    pub result: flowacct_worker::Result<WorkerSummary>,
}

pub struct Pipeline {
    distributor: Distributor,
    workers: JoinSet<WorkerExit>,
    /// Channel and plugin name of every running worker task.
    tasks: HashMap<Id, (ChannelId, String)>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Start with the backend each plugin's `kind` selects.
    pub fn start(config: &Config, metrics: &MetricsCollector) -> Result<Self> {
        Self::start_with_backends(config, metrics, |plugin| plugin.kind.build())
    }

    /// Start with caller-provided backends.
    pub fn start_with_backends<F>(
        config: &Config,
        metrics: &MetricsCollector,
        backend_for: F,
    ) -> Result<Self>
    where
        F: Fn(&PluginConfig) -> Arc<dyn Backend>,
    {
        let cancel = CancellationToken::new();
        let mut registry = ChannelRegistry::new(metrics.channels().clone());
        let mut workers = JoinSet::new();
        let mut tasks = HashMap::new();

        for plugin in &config.plugins {
            let template = plugin.channel_template()?;
            let (id, reader) = registry
                .insert(template)
                .with_context(|| format!("setting up channel for plugin {}", plugin.name))?;

            let counters = metrics.workers().for_worker(&plugin.name);
            let writer = PurgeWriter::new(backend_for(plugin), plugin.writer_config()?, counters.clone());
            let worker = Worker::new(plugin.worker_settings()?, writer, counters);
            let token = cancel.child_token();
            let name = plugin.name.clone();

            let handle = workers.spawn(async move {
                let result = worker.run(reader, token).await;
                WorkerExit {
                    channel: id,
                    name,
                    result,
                }
            });
            tasks.insert(handle.id(), (id, plugin.name.clone()));
        }

        info!(plugins = config.plugins.len(), "pipeline started");
        Ok(Self {
            distributor: Distributor::new(registry),
            workers,
            tasks,
            cancel,
        })
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    pub fn dispatch(&mut self, flow: &DecodedFlow) -> Dispatch {
        self.distributor.exec(flow)
    }

    /// Publish partially filled batches.
    pub fn flush(&mut self) {
        self.distributor.flush_all();
    }

    /// Wait for the next worker to finish and drop its channel.
    ///
    /// Pending forever when no worker is left.
    pub async fn next_exit(&mut self) -> WorkerExit {
        match self.workers.join_next_with_id().await {
            Some(joined) => self.reap(joined),
            None => std::future::pending().await,
        }
    }

    pub fn has_workers(&self) -> bool {
        !self.workers.is_empty()
    }

    fn reap(&mut self, joined: std::result::Result<(Id, WorkerExit), JoinError>) -> WorkerExit {
        let exit = match joined {
            Ok((id, exit)) => {
                self.tasks.remove(&id);
                match &exit.result {
                    Ok(summary) => info!(
                        worker = %exit.name,
                        records = summary.records,
                        purges = summary.purges,
                        "worker exited"
                    ),
                    Err(e) => error!(worker = %exit.name, error = %e, "worker exited with error"),
                }
                exit
            }
            Err(e) => {
                let result = Err(flowacct_worker::WorkerError::Transport(e.to_string()));
                let Some((channel, name)) = self.tasks.remove(&e.id()) else {
                    error!(error = %e, "untracked worker task failed");
                    return WorkerExit {
                        channel: 0,
                        name: String::new(),
                        result,
                    };
                };
                error!(worker = %name, channel, error = %e, "worker task failed");
                WorkerExit {
                    channel,
                    name,
                    result,
                }
            }
        };
        if self.distributor.registry().get(exit.channel).is_some() {
            if let Err(e) = self.distributor.remove_channel(exit.channel) {
                warn!(worker = %exit.name, error = %e, "unable to remove channel");
            }
        }
        exit
    }

    /// Close every channel and wait for the workers to drain.
    ///
    /// Workers still running after `grace` are cancelled; they purge what
    /// they hold and exit.
    pub async fn shutdown(mut self, grace: Duration) -> Vec<WorkerExit> {
        self.distributor.shutdown();
        let mut exits = Vec::new();

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        while !self.workers.is_empty() {
            tokio::select! {
                Some(joined) = self.workers.join_next_with_id() => exits.push(self.reap(joined)),
                _ = &mut deadline, if !self.cancel.is_cancelled() => {
                    warn!(remaining = self.workers.len(), "workers did not drain in time, cancelling");
                    self.cancel.cancel();
                }
            }
        }
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowacct_worker::backend::BackendSession;

    struct PanickingBackend;

    #[async_trait]
    impl Backend for PanickingBackend {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn connect(&self, host: &str) -> flowacct_worker::Result<Box<dyn BackendSession>> {
            panic!("backend for {} blew up", host);
        }
    }

    #[tokio::test]
    async fn test_panicked_worker_releases_its_channel() {
        let config = Config::from_yaml(
            r#"
plugins:
  - name: first
    kind: memory
    aggregate: src_port
  - name: doomed
    kind: memory
    aggregate: src_port
"#,
        )
        .unwrap();
        let metrics = MetricsCollector::new().unwrap();
        let mut pipeline = Pipeline::start_with_backends(&config, &metrics, |plugin| {
            if plugin.name == "doomed" {
                Arc::new(PanickingBackend) as Arc<dyn Backend>
            } else {
                plugin.kind.build()
            }
        })
        .unwrap();
        let doomed = pipeline
            .tasks
            .values()
            .find(|(_, name)| name == "doomed")
            .map(|(id, _)| *id)
            .unwrap();

        pipeline.dispatch(&DecodedFlow::from_json(r#"{"src_port":80,"bytes":10}"#).unwrap());
        pipeline.flush();
        let received = r#"flowacct_worker_records_received_total{worker="doomed"} 1"#;
        for _ in 0..500 {
            if metrics.gather_text().unwrap().contains(received) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // only the doomed worker purges on exit and hits the panic
        pipeline.cancel.cancel();
        let mut exits = Vec::new();
        while exits.len() < 2 {
            exits.push(pipeline.next_exit().await);
        }
        let failed = exits.iter().find(|e| e.result.is_err()).unwrap();
        assert_eq!(failed.channel, doomed);
        assert_eq!(failed.name, "doomed");
        assert!(pipeline.distributor().registry().get(doomed).is_none());
        assert!(pipeline.distributor().registry().is_empty());
        assert!(pipeline.tasks.is_empty());
    }
}
