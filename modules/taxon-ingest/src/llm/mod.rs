//! OpenAI-backed oracle.
//!
//! Every structured call forces a single function whose parameters are a
//! strict JSON schema, so replies arrive as function arguments rather than
//! free text. The analysis session runs the usual multi-turn tool loop.

mod client;
mod prompts;
mod schema;
mod types;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use taxon_common::{IngestConfig, Metadata, ModelsConfig, ObjectRecord};

use crate::schema::{ExtractionSchema, TypeDescription};
use crate::session::{within, Stage};
use crate::traits::{
    touched_from_result, Oracle, OracleOutput, SessionOutcome, SessionTools, TextEmbedder,
};

use client::OpenAiClient;
use schema::Selection;
use types::{ChatRequest, ToolDefinitionWire, WireMessage};

pub(crate) use prompts::truncate_to_char_boundary;

const SELECT_OBJECT_TYPE: &str = "select_object_type";
const RECORD_OBJECT: &str = "record_object";
const SELECT_MATCH: &str = "select_match";
const NO_MATCH: &str = "none";

#[derive(Debug, Deserialize, JsonSchema)]
struct TypeChoice {
    /// Id of the chosen object type.
    object_type_id: String,
}

impl Selection for TypeChoice {
    const FIELD: &'static str = "object_type_id";

    fn into_selected(self) -> String {
        self.object_type_id
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MatchChoice {
    /// Id of the matching candidate, or "none".
    match_id: String,
}

impl Selection for MatchChoice {
    const FIELD: &'static str = "match_id";

    fn into_selected(self) -> String {
        self.match_id
    }
}

pub struct OpenAiOracle {
    client: OpenAiClient,
    models: ModelsConfig,
    max_session_turns: usize,
    max_payload_chars: usize,
}

impl OpenAiOracle {
    pub fn new(api_key: &str, models: ModelsConfig, ingest: &IngestConfig) -> Result<Self> {
        Ok(Self {
            client: OpenAiClient::new(api_key)?,
            models,
            max_session_turns: ingest.max_session_turns,
            max_payload_chars: ingest.max_payload_chars,
        })
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.client = self.client.with_base_url(url);
        self
    }

    /// Send one request that must be answered by calling `tool`.
    async fn forced_call(
        &self,
        model: &str,
        system: &str,
        user: String,
        tool: ToolDefinitionWire,
    ) -> Result<OracleOutput> {
        let function = tool.function.name.clone();
        let request = ChatRequest::new(model)
            .message(WireMessage::system(system))
            .message(WireMessage::user(user))
            .temperature(temperature_for(model))
            .tool(tool)
            .force_function(&function);

        let message = self.client.complete(&request).await?;
        Ok(function_output(message, &function))
    }

    /// Forced call whose only job is to pick one of `allowed`.
    async fn select<S: Selection>(
        &self,
        model: &str,
        system: &str,
        user: String,
        (function, description): (&str, &str),
        allowed: &[String],
    ) -> Result<String> {
        let tool = ToolDefinitionWire::function(function, description, S::parameters(allowed)?);
        let output = self.forced_call(model, system, user, tool).await?;
        let choice: S = parse_reply(output, function)?;
        Ok(choice.into_selected())
    }
}

/// Reasoning models reject an explicit temperature.
fn temperature_for(model: &str) -> Option<f32> {
    if model.starts_with("gpt-5") || model.starts_with('o') {
        None
    } else {
        Some(0.0)
    }
}

fn function_output(message: WireMessage, function: &str) -> OracleOutput {
    let call = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .find(|tc| tc.function.name == function);

    match call {
        Some(tc) => match serde_json::from_str(&tc.function.arguments) {
            Ok(args) => OracleOutput::Function(args),
            Err(_) => OracleOutput::Text(tc.function.arguments),
        },
        None => OracleOutput::Text(message.content.unwrap_or_default()),
    }
}

fn parse_reply<T: for<'de> Deserialize<'de>>(output: OracleOutput, function: &str) -> Result<T> {
    match output {
        OracleOutput::Function(args) => Ok(serde_json::from_value(args)?),
        OracleOutput::Text(text) => bail!("oracle did not call {function}: {text}"),
    }
}

fn parse_match(match_id: &str, candidates: &[ObjectRecord]) -> Result<Option<Uuid>> {
    if match_id == NO_MATCH {
        return Ok(None);
    }
    let id = Uuid::parse_str(match_id)?;
    if !candidates.iter().any(|c| c.id == id) {
        bail!("oracle matched unknown candidate {id}");
    }
    Ok(Some(id))
}

#[async_trait]
impl Oracle for OpenAiOracle {
    async fn classify(
        &self,
        candidates: &[TypeDescription],
        payload: &serde_json::Value,
    ) -> Result<String> {
        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let payload = prompts::render_payload(payload, self.max_payload_chars);

        let object_type_id = self
            .select::<TypeChoice>(
                &self.models.classification,
                prompts::CLASSIFY_SYSTEM,
                prompts::classify_prompt(candidates, &payload),
                (
                    SELECT_OBJECT_TYPE,
                    "Select the object type that best describes the payload.",
                ),
                &ids,
            )
            .await?;

        debug!(object_type_id = %object_type_id, "Oracle classified payload");
        Ok(object_type_id)
    }

    async fn extract(
        &self,
        schema: &ExtractionSchema,
        payload: &serde_json::Value,
        guidance: Option<&str>,
    ) -> Result<OracleOutput> {
        let tool = ToolDefinitionWire::function(
            RECORD_OBJECT,
            format!("Record a {} object.", schema.object_type_id),
            schema.to_json_schema(),
        );
        let payload = prompts::render_payload(payload, self.max_payload_chars);

        self.forced_call(
            &self.models.extraction,
            prompts::EXTRACT_SYSTEM,
            prompts::extract_prompt(&payload, guidance),
            tool,
        )
        .await
    }

    async fn merge(
        &self,
        schema: &ExtractionSchema,
        existing: &Metadata,
        incoming: &Metadata,
    ) -> Result<OracleOutput> {
        let tool = ToolDefinitionWire::function(
            RECORD_OBJECT,
            format!("Record the reconciled {} object.", schema.object_type_id),
            schema.to_json_schema(),
        );

        self.forced_call(
            &self.models.merge,
            prompts::MERGE_SYSTEM,
            prompts::merge_prompt(existing, incoming),
            tool,
        )
        .await
    }

    async fn resolve_best_match(
        &self,
        candidates: &[ObjectRecord],
        target: &serde_json::Value,
    ) -> Result<Option<Uuid>> {
        let mut ids: Vec<String> = candidates.iter().map(|c| c.id.to_string()).collect();
        ids.push(NO_MATCH.to_string());
        let target = prompts::render_payload(target, self.max_payload_chars);

        let match_id = self
            .select::<MatchChoice>(
                &self.models.classification,
                prompts::MATCH_SYSTEM,
                prompts::match_prompt(candidates, &target),
                (SELECT_MATCH, "Select the candidate the new object belongs to."),
                &ids,
            )
            .await?;

        parse_match(&match_id, candidates)
    }

    async fn run_session(
        &self,
        prompt: &str,
        tools: &dyn SessionTools,
        deadline: Option<Instant>,
    ) -> Result<SessionOutcome> {
        let model = &self.models.analysis;
        let mut request = ChatRequest::new(model.as_str())
            .message(WireMessage::system(prompts::ANALYSIS_SYSTEM))
            .message(WireMessage::user(prompt))
            .temperature(temperature_for(model));
        for def in tools.definitions() {
            request = request.tool(ToolDefinitionWire::function(
                def.name,
                def.description,
                def.parameters,
            ));
        }
        if request.tools.is_some() {
            request.tool_choice = Some(serde_json::json!("auto"));
        }

        let mut touched = Vec::new();
        let mut turn = 0;
        loop {
            turn += 1;
            if turn > self.max_session_turns {
                return Err(anyhow!("Max turns ({}) exceeded", self.max_session_turns));
            }

            // Tool calls below run unbounded; only the round-trip is cancellable.
            let message = within(deadline, Stage::Analysis, self.client.complete(&request)).await??;

            let tool_calls = message.tool_calls.unwrap_or_default();
            if tool_calls.is_empty() {
                return Ok(SessionOutcome {
                    summary: message.content.unwrap_or_default(),
                    touched,
                });
            }

            request.messages.push(WireMessage::assistant_calls(
                message.content,
                tool_calls.clone(),
            ));

            for tc in tool_calls {
                let args: serde_json::Value =
                    serde_json::from_str(&tc.function.arguments).unwrap_or_default();

                debug!(tool = %tc.function.name, turn, "Executing tool call");

                let result = match tools.call(&tc.function.name, args).await {
                    Ok(v) => {
                        if let Some(r) = touched_from_result(&v) {
                            touched.push(r);
                        }
                        serde_json::to_string(&v)?
                    }
                    Err(e) => {
                        warn!(tool = %tc.function.name, error = %e, "Tool call failed");
                        format!("Error: {}", e)
                    }
                };

                request.messages.push(WireMessage::tool(&tc.id, result));
            }
        }
    }
}

#[async_trait]
impl TextEmbedder for OpenAiOracle {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_to_char_boundary(text, self.max_payload_chars);
        self.client.embed(&self.models.embedding, text).await
    }
}
