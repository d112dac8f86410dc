//! The external agent reasoning engine is a black box: given a mandate and
//! a tick budget it returns a deliverable and progress ticks. This module
//! defines only the seam the worker lifecycle drives it through.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::CompletionResult;
use crate::Result;

/// Cheap, `Clone`-able handle the engine calls after each tick so the
/// worker's heartbeat can observe progress without polling the engine
/// directly.
#[derive(Clone)]
pub struct TickReporter {
    sender: watch::Sender<u32>,
}

impl TickReporter {
    pub fn new() -> (Self, watch::Receiver<u32>) {
        let (sender, receiver) = watch::channel(0);
        (Self { sender }, receiver)
    }

    pub fn report(&self, tick: u32) {
        let _ = self.sender.send(tick);
    }
}

#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn run(
        &self,
        mandate: &str,
        max_ticks: u32,
        ticks: TickReporter,
    ) -> Result<CompletionResult>;
}

/// Test double driving a fixed tick count and a fixed outcome, with an
/// optional injected delay or error. Stands in for the unspecified
/// reasoning engine in integration tests.
pub struct ScriptedAgentEngine {
    pub ticks_to_report: u32,
    pub tick_delay: std::time::Duration,
    pub outcome: Result<CompletionResult>,
}

impl ScriptedAgentEngine {
    pub fn success(deliverables: Vec<String>) -> Self {
        Self {
            ticks_to_report: 1,
            tick_delay: std::time::Duration::from_millis(0),
            outcome: Ok(CompletionResult {
                success: true,
                deliverables,
                notes: String::new(),
            }),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ticks_to_report: 0,
            tick_delay: std::time::Duration::from_millis(0),
            outcome: Err(crate::error::SubstrateError::TaskExecution {
                correlation_id: "scripted".into(),
                message: error.into(),
            }),
        }
    }
}

#[async_trait]
impl AgentEngine for ScriptedAgentEngine {
    async fn run(
        &self,
        _mandate: &str,
        _max_ticks: u32,
        ticks: TickReporter,
    ) -> Result<CompletionResult> {
        for tick in 1..=self.ticks_to_report {
            tokio::time::sleep(self.tick_delay).await;
            ticks.report(tick);
        }
        match &self.outcome {
            Ok(result) => Ok(result.clone()),
            Err(_) => Err(crate::error::SubstrateError::TaskExecution {
                correlation_id: "scripted".into(),
                message: "scripted failure".into(),
            }),
        }
    }
}
