//! Config flow engine
//!
//! A config flow is a small state machine that walks a user (or a discovery
//! source) through setting up an integration. Each step returns a
//! [`FlowStep`]: show a form, create a config entry, or abort with a reason.
//! The [`FlowManager`] keeps in-progress flows keyed by flow id and applies
//! the shared rules around unique ids and duplicate entries.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config_entries::{ConfigEntries, ConfigEntry, ConfigEntrySource};

/// Unique id used by discovery flows that have no stable identifier.
pub const DEFAULT_DISCOVERY_UNIQUE_ID: &str = "default_discovery_unique_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Boolean,
    Select,
}

/// One field of a form schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// (value, label) pairs for select fields.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<(String, String)>,
}

impl FormField {
    pub fn string(name: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::String,
            required: true,
            default: None,
            options: Vec::new(),
        }
    }

    pub fn boolean(name: &str, default: bool) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::Boolean,
            required: false,
            default: Some(Value::Bool(default)),
            options: Vec::new(),
        }
    }

    pub fn select(name: &str, options: Vec<(String, String)>) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::Select,
            required: true,
            default: None,
            options,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("required key not provided: {0}")]
    Missing(String),
    #[error("extra keys not allowed: {0}")]
    Extra(String),
    #[error("expected {expected} for {field}")]
    WrongType { field: String, expected: &'static str },
    #[error("value is not a valid option for {0}")]
    NotAnOption(String),
}

/// Check user input against a form schema, filling in defaults.
pub fn validate_input(schema: &[FormField], input: &Map<String, Value>) -> Result<Map<String, Value>, SchemaError> {
    if let Some(extra) = input.keys().find(|k| !schema.iter().any(|f| &f.name == *k)) {
        return Err(SchemaError::Extra(extra.clone()));
    }

    let mut out = Map::new();
    for field in schema {
        let value = match input.get(&field.name) {
            Some(v) => v.clone(),
            None => match &field.default {
                Some(d) => d.clone(),
                None if field.required => return Err(SchemaError::Missing(field.name.clone())),
                None => continue,
            },
        };

        match field.field_type {
            FieldType::String if !value.is_string() => {
                return Err(SchemaError::WrongType {
                    field: field.name.clone(),
                    expected: "str",
                });
            }
            FieldType::Boolean if !value.is_boolean() => {
                return Err(SchemaError::WrongType {
                    field: field.name.clone(),
                    expected: "bool",
                });
            }
            FieldType::Select => {
                let valid = value
                    .as_str()
                    .map(|s| field.options.iter().any(|(v, _)| v == s))
                    .unwrap_or(false);
                if !valid {
                    return Err(SchemaError::NotAnOption(field.name.clone()));
                }
            }
            _ => {}
        }
        out.insert(field.name.clone(), value);
    }
    Ok(out)
}

/// Outcome of one flow step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowStep {
    Form {
        step_id: String,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
    },
    CreateEntry {
        title: String,
        data: Map<String, Value>,
    },
    Abort {
        reason: String,
    },
}

impl FlowStep {
    pub fn form(step_id: &str, data_schema: Vec<FormField>) -> Self {
        Self::form_with_errors(step_id, data_schema, HashMap::new())
    }

    pub fn form_with_errors(step_id: &str, data_schema: Vec<FormField>, errors: HashMap<String, String>) -> Self {
        FlowStep::Form {
            step_id: step_id.to_string(),
            data_schema,
            errors,
        }
    }

    pub fn create_entry(title: impl Into<String>, data: Map<String, Value>) -> Self {
        FlowStep::CreateEntry {
            title: title.into(),
            data,
        }
    }

    pub fn abort(reason: &str) -> Self {
        FlowStep::Abort {
            reason: reason.to_string(),
        }
    }
}

/// Raised from anywhere inside a step to end the flow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("flow aborted: {reason}")]
pub struct AbortFlow {
    pub reason: String,
}

impl AbortFlow {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl From<AbortFlow> for FlowStep {
    fn from(abort: AbortFlow) -> Self {
        FlowStep::Abort { reason: abort.reason }
    }
}

pub type StepResult = Result<FlowStep, AbortFlow>;

/// Unique id claimed by every live flow, keyed by flow id. A flow is live
/// from `init` until it creates an entry or aborts, including while one of
/// its steps is running.
type Claims = std::sync::Mutex<HashMap<String, Option<String>>>;

fn lock_claims(claims: &Claims) -> MutexGuard<'_, HashMap<String, Option<String>>> {
    claims.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a flow step can see and change outside the flow itself.
pub struct FlowContext<'a> {
    pub domain: &'static str,
    pub source: ConfigEntrySource,
    pub unique_id: Option<String>,
    flow_id: &'a str,
    entries: &'a ConfigEntries,
    claims: &'a Claims,
}

impl<'a> FlowContext<'a> {
    fn new(
        domain: &'static str,
        source: ConfigEntrySource,
        flow_id: &'a str,
        unique_id: Option<String>,
        entries: &'a ConfigEntries,
        claims: &'a Claims,
    ) -> Self {
        Self {
            domain,
            source,
            unique_id,
            flow_id,
            entries,
            claims,
        }
    }

    /// Claim a unique id for this flow. With `raise_on_progress`, abort if
    /// another live flow already holds it. Check and claim are one step.
    pub fn set_unique_id(&mut self, unique_id: impl Into<String>, raise_on_progress: bool) -> Result<(), AbortFlow> {
        let unique_id = unique_id.into();
        let mut claims = lock_claims(self.claims);
        if raise_on_progress
            && claims
                .iter()
                .any(|(flow_id, id)| flow_id != self.flow_id && id.as_deref() == Some(unique_id.as_str()))
        {
            return Err(AbortFlow::new("already_in_progress"));
        }
        claims.insert(self.flow_id.to_string(), Some(unique_id.clone()));
        self.unique_id = Some(unique_id);
        Ok(())
    }

    fn other_flows_live(&self) -> bool {
        lock_claims(self.claims).keys().any(|flow_id| flow_id != self.flow_id)
    }

    /// Abort if an entry with this flow's unique id exists, first merging
    /// `updates` into that entry's data.
    pub fn abort_if_unique_id_configured(&self, updates: &Map<String, Value>) -> Result<(), AbortFlow> {
        let Some(unique_id) = self.unique_id.as_deref() else {
            return Ok(());
        };
        let existing = self
            .entries
            .entries(self.domain)
            .into_iter()
            .find(|e| e.unique_id.as_deref() == Some(unique_id));
        if let Some(entry) = existing {
            if !updates.is_empty() && self.entries.update_data(&entry.entry_id, updates) {
                tracing::info!(domain = self.domain, unique_id, "Updated existing config entry from discovery");
            }
            return Err(AbortFlow::new("already_configured"));
        }
        Ok(())
    }

    /// Abort if any entry of this domain has `data[key] == value`.
    pub fn abort_entries_match(&self, key: &str, value: &Value) -> Result<(), AbortFlow> {
        if self
            .entries
            .entries(self.domain)
            .iter()
            .any(|e| e.data.get(key) == Some(value))
        {
            return Err(AbortFlow::new("already_configured"));
        }
        Ok(())
    }

    pub fn current_ids(&self, include_ignore: bool) -> HashSet<String> {
        self.entries.current_ids(self.domain, include_ignore)
    }

    /// Mark a discovery flow that has no stable identifier. Only one such
    /// flow may run, and only while the domain has no entries at all.
    pub fn handle_discovery_without_unique_id(&mut self) -> Result<(), AbortFlow> {
        if self.unique_id.is_some() {
            return Ok(());
        }
        if !self.entries.entries(self.domain).is_empty() {
            return Err(AbortFlow::new("already_configured"));
        }
        self.set_unique_id(DEFAULT_DISCOVERY_UNIQUE_ID, true)?;
        self.abort_if_unique_id_configured(&Map::new())?;
        if self.other_flows_live() {
            return Err(AbortFlow::new("already_in_progress"));
        }
        Ok(())
    }

    /// Record a dismissed discovery as an ignore entry.
    pub fn ignore(&mut self, data: Option<Value>) -> StepResult {
        let data = data.unwrap_or_default();
        let unique_id = data
            .get("unique_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AbortFlow::new("unknown"))?;
        let title = data.get("title").and_then(Value::as_str).unwrap_or_default().to_string();
        self.set_unique_id(unique_id, false)?;
        Ok(FlowStep::create_entry(title, Map::new()))
    }
}

/// An integration's setup flow.
#[async_trait]
pub trait ConfigFlow: Send {
    const DOMAIN: &'static str;

    /// First step. `data` carries discovery or import info for non-user sources.
    async fn start(&mut self, ctx: &mut FlowContext<'_>, data: Option<Value>) -> StepResult;

    /// Handle submitted input for the form named `step_id`.
    async fn step(&mut self, ctx: &mut FlowContext<'_>, step_id: &str, input: Map<String, Value>) -> StepResult;

    fn supports_options(_entry: &ConfigEntry) -> bool
    where
        Self: Sized,
    {
        false
    }

    fn options_schema(_entry: &ConfigEntry) -> Vec<FormField>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("unknown flow: {0}")]
    UnknownFlow(String),
    #[error("unknown config entry: {0}")]
    UnknownEntry(String),
    #[error("config entry {0} has no options")]
    OptionsNotSupported(String),
    #[error("invalid user input: {0}")]
    InvalidInput(#[from] SchemaError),
}

/// Result sent back to the caller of a flow operation.
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    pub handler: String,
    #[serde(flatten)]
    pub step: FlowStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
}

/// Summary of a flow that is waiting for input.
#[derive(Debug, Clone, Serialize)]
pub struct FlowProgress {
    pub flow_id: String,
    pub handler: String,
    pub step_id: String,
    pub source: ConfigEntrySource,
    pub unique_id: Option<String>,
}

struct PendingFlow<F> {
    flow: F,
    source: ConfigEntrySource,
    unique_id: Option<String>,
    step_id: String,
    schema: Vec<FormField>,
}

struct PendingOptions {
    entry_id: String,
    schema: Vec<FormField>,
}

/// Runs flows of one integration and owns their in-progress state.
pub struct FlowManager<F: ConfigFlow> {
    entries: Arc<ConfigEntries>,
    factory: Box<dyn Fn() -> F + Send + Sync>,
    flows: Mutex<HashMap<String, PendingFlow<F>>>,
    claims: Claims,
    options_flows: DashMap<String, PendingOptions>,
}

impl<F: ConfigFlow> FlowManager<F> {
    pub fn new(entries: Arc<ConfigEntries>, factory: impl Fn() -> F + Send + Sync + 'static) -> Self {
        Self {
            entries,
            factory: Box::new(factory),
            flows: Mutex::new(HashMap::new()),
            claims: Claims::default(),
            options_flows: DashMap::new(),
        }
    }

    pub fn handler(&self) -> &'static str {
        F::DOMAIN
    }

    pub fn entries(&self) -> &Arc<ConfigEntries> {
        &self.entries
    }

    /// Start a new flow from `source`.
    pub async fn init(&self, source: ConfigEntrySource, data: Option<Value>) -> Result<FlowResult, FlowError> {
        let flow_id = uuid::Uuid::new_v4().simple().to_string();
        let mut flow = (self.factory)();
        lock_claims(&self.claims).insert(flow_id.clone(), None);

        let mut ctx = FlowContext::new(F::DOMAIN, source, &flow_id, None, &self.entries, &self.claims);
        let outcome = if source == ConfigEntrySource::Ignore {
            ctx.ignore(data)
        } else {
            flow.start(&mut ctx, data).await
        }
        .unwrap_or_else(FlowStep::from);
        let unique_id = ctx.unique_id;

        tracing::debug!(flow_id = %flow_id, handler = F::DOMAIN, source = source.as_str(), "Flow started");
        Ok(self.finish(flow_id, flow, source, unique_id, outcome).await)
    }

    /// Submit input to the current step of a flow.
    pub async fn configure(&self, flow_id: &str, input: Map<String, Value>) -> Result<FlowResult, FlowError> {
        let mut pending = self
            .flows
            .lock()
            .await
            .remove(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;

        let input = match validate_input(&pending.schema, &input) {
            Ok(input) => input,
            Err(e) => {
                self.flows.lock().await.insert(flow_id.to_string(), pending);
                return Err(e.into());
            }
        };

        let mut ctx = FlowContext::new(
            F::DOMAIN,
            pending.source,
            flow_id,
            pending.unique_id.clone(),
            &self.entries,
            &self.claims,
        );
        let step_id = pending.step_id.clone();
        let outcome = pending
            .flow
            .step(&mut ctx, &step_id, input)
            .await
            .unwrap_or_else(FlowStep::from);
        let unique_id = ctx.unique_id;

        Ok(self
            .finish(flow_id.to_string(), pending.flow, pending.source, unique_id, outcome)
            .await)
    }

    /// Flows currently waiting for input.
    pub async fn progress(&self) -> Vec<FlowProgress> {
        self.flows
            .lock()
            .await
            .iter()
            .map(|(flow_id, pending)| FlowProgress {
                flow_id: flow_id.clone(),
                handler: F::DOMAIN.to_string(),
                step_id: pending.step_id.clone(),
                source: pending.source,
                unique_id: pending.unique_id.clone(),
            })
            .collect()
    }

    /// Open the options form for an entry.
    pub fn options_init(&self, entry_id: &str) -> Result<FlowResult, FlowError> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| FlowError::UnknownEntry(entry_id.to_string()))?;
        if !F::supports_options(&entry) {
            return Err(FlowError::OptionsNotSupported(entry_id.to_string()));
        }

        let schema = F::options_schema(&entry);
        let flow_id = uuid::Uuid::new_v4().simple().to_string();
        self.options_flows.insert(
            flow_id.clone(),
            PendingOptions {
                entry_id: entry_id.to_string(),
                schema: schema.clone(),
            },
        );
        Ok(FlowResult {
            flow_id,
            handler: entry_id.to_string(),
            step: FlowStep::form("init", schema),
            entry_id: None,
        })
    }

    /// Submit the options form; the validated input becomes the entry's options.
    pub fn options_configure(&self, flow_id: &str, input: Map<String, Value>) -> Result<FlowResult, FlowError> {
        let (_, pending) = self
            .options_flows
            .remove(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;

        let options = match validate_input(&pending.schema, &input) {
            Ok(options) => options,
            Err(e) => {
                self.options_flows.insert(flow_id.to_string(), pending);
                return Err(e.into());
            }
        };
        if !self.entries.update_options(&pending.entry_id, options.clone()) {
            return Err(FlowError::UnknownEntry(pending.entry_id));
        }

        Ok(FlowResult {
            flow_id: flow_id.to_string(),
            handler: pending.entry_id.clone(),
            step: FlowStep::create_entry("", options),
            entry_id: Some(pending.entry_id),
        })
    }

    async fn finish(
        &self,
        flow_id: String,
        flow: F,
        source: ConfigEntrySource,
        unique_id: Option<String>,
        outcome: FlowStep,
    ) -> FlowResult {
        let mut entry_id = None;
        match &outcome {
            FlowStep::Form { step_id, data_schema, .. } => {
                self.flows.lock().await.insert(
                    flow_id.clone(),
                    PendingFlow {
                        flow,
                        source,
                        unique_id,
                        step_id: step_id.clone(),
                        schema: data_schema.clone(),
                    },
                );
            }
            FlowStep::CreateEntry { title, data } => {
                lock_claims(&self.claims).remove(&flow_id);
                let entry = ConfigEntry::new(F::DOMAIN, title.clone(), data.clone(), source, unique_id);
                self.replace_duplicates(&entry);
                entry_id = Some(entry.entry_id.clone());
                self.entries.add(entry);
            }
            FlowStep::Abort { reason } => {
                lock_claims(&self.claims).remove(&flow_id);
                tracing::debug!(flow_id = %flow_id, handler = F::DOMAIN, "Flow aborted: {}", reason);
            }
        }

        FlowResult {
            flow_id,
            handler: F::DOMAIN.to_string(),
            step: outcome,
            entry_id,
        }
    }

    /// Drop existing entries that the new one supersedes: same unique id, or same host.
    fn replace_duplicates(&self, new_entry: &ConfigEntry) {
        for existing in self.entries.entries(F::DOMAIN) {
            let same_id = new_entry.unique_id.is_some() && existing.unique_id == new_entry.unique_id;
            let same_host = new_entry.host().is_some() && existing.host() == new_entry.host();
            if same_id || same_host {
                tracing::info!(
                    handler = F::DOMAIN,
                    entry_id = %existing.entry_id,
                    "Replacing config entry: {}",
                    existing.title
                );
                self.entries.remove(&existing.entry_id);
            }
        }
    }
}
