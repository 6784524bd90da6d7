//! AI-assisted automation generation seam
//!
//! The engine never talks to a model provider directly; it hands the
//! prompt and a context snapshot to an [`AutomationGenerator`] and
//! validates whatever comes back. Anything unusable is a hard
//! `Generation` failure and creates nothing.

use crate::model::Automation;
use async_trait::async_trait;
use device_registry::Device;
use serde::Serialize;

/// Snapshot handed to the generator alongside the prompt
#[derive(Debug, Clone, Serialize)]
pub struct GenerationContext {
    pub devices: Vec<Device>,
    pub automations: Vec<Automation>,
}

/// External collaborator turning free text into a structured automation
/// spec. The returned value must decode as a create-automation request.
#[async_trait]
pub trait AutomationGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        context: &GenerationContext,
    ) -> Result<serde_json::Value, String>;
}
