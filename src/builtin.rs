//! Payload-agnostic task types shipped with the scheduler.
//!
//! - `echo`: finishes in one step with its message as output
//! - `fan_out`: spawns one `echo` child per item, then joins their outputs
//!
//! Both are small enough to exercise every path of the scheduler (single
//! steps, children, parent wake-up, output collection) without any domain
//! payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::task::{
    decode_state, encode_state, Requirements, Task, TaskContext, TaskRegistry,
};

pub const ECHO: &str = "echo";
pub const FAN_OUT: &str = "fan_out";

/// Registry with every built-in task type.
pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register_default::<EchoTask>(ECHO)
        .register_default::<FanOutTask>(FAN_OUT);
    registry
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EchoTask {
    message: String,
    #[serde(default)]
    requirements: Option<Requirements>,
}

impl EchoTask {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            requirements: None,
        }
    }

    /// Ask for `memory_mb` of memory, which may move the task to another
    /// profile.
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        let mut requirements = self.requirements.unwrap_or_default();
        requirements.memory_mb = memory_mb;
        self.requirements = Some(requirements);
        self
    }
}

#[async_trait]
impl Task for EchoTask {
    async fn run(&mut self, ctx: &mut dyn TaskContext) -> anyhow::Result<()> {
        ctx.update_progress(0.5).await?;
        ctx.set_output_string(self.message.clone());
        Ok(())
    }

    fn load_state(&mut self, state: &[u8]) -> anyhow::Result<()> {
        *self = decode_state(state)?;
        Ok(())
    }

    fn dump_state(&self) -> anyhow::Result<Vec<u8>> {
        encode_state(self)
    }

    fn requirements(&self) -> Requirements {
        self.requirements.unwrap_or_default()
    }
}

/// Share of the budget kept by the splitting step and by the joining step.
const FAN_OUT_OWN_PART: f64 = 0.1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FanOutTask {
    items: Vec<String>,
    /// Subtask ids of the spawned children, in item order
    #[serde(default)]
    children: Vec<usize>,
    #[serde(default)]
    collected: Vec<String>,
}

impl FanOutTask {
    pub fn new(items: Vec<String>) -> Self {
        Self {
            items,
            children: Vec::new(),
            collected: Vec::new(),
        }
    }

    /// Child outputs gathered by the joining step.
    pub fn collected(&self) -> &[String] {
        &self.collected
    }
}

#[async_trait]
impl Task for FanOutTask {
    async fn run(&mut self, ctx: &mut dyn TaskContext) -> anyhow::Result<()> {
        if self.items.is_empty() {
            ctx.set_output_string(String::new());
            return Ok(());
        }

        if self.children.is_empty() {
            ctx.split_progress(FAN_OUT_OWN_PART, FAN_OUT_OWN_PART)?;
            for item in &self.items {
                let id = ctx.add_subtask(ECHO, Box::new(EchoTask::new(item.clone()))).await?;
                self.children.push(id);
            }
            tracing::debug!("Fanned out {} items", self.children.len());
            return Ok(());
        }

        self.collected.clear();
        for (done, id) in self.children.iter().enumerate() {
            self.collected.push(ctx.get_output_string(*id).await?);
            ctx.update_progress((done + 1) as f64 / self.children.len() as f64)
                .await?;
        }
        ctx.set_output_string(self.collected.join("\n"));
        Ok(())
    }

    fn load_state(&mut self, state: &[u8]) -> anyhow::Result<()> {
        *self = decode_state(state)?;
        Ok(())
    }

    fn dump_state(&self) -> anyhow::Result<Vec<u8>> {
        encode_state(self)
    }

    fn subtype(&self) -> String {
        format!("{}-items", self.items.len())
    }
}
