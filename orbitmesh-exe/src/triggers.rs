//  TRIGGERS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the trigger service: workflows register their triggers at
//!   activation time; events, webhooks and manual submissions are matched
//!   against the indexes and mapped into workflow starts. Schedule
//!   triggers are fired by an external scheduler through synthetic
//!   events.
//

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::Value;

use crate::engine::WorkflowEngine;
pub use crate::errors::TriggerError as Error;
use crate::expression::{self, INPUT_VARIABLE};
use crate::instance::WorkflowInstance;
use crate::workflow::{InputField, TriggerDefinition, TriggerKind, WorkflowDefinition};


/***** CONSTANTS *****/
/// The header a webhook caller presents its shared secret in.
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";





/***** AUXILLARY *****/
/// One registered trigger, bound to the workflow version that declared it.
#[derive(Clone, Debug)]
pub struct TriggerRegistration {
    /// The trigger as declared.
    pub trigger: TriggerDefinition,
    /// The workflow it starts.
    pub workflow_id: String,
    /// The declaring version (started explicitly, not "latest").
    pub workflow_version: String,
}

/// Builds the expression scope for payload-mapping expressions.
fn payload_scope(payload: &Value) -> HashMap<String, Value> { HashMap::from([(INPUT_VARIABLE.to_string(), payload.clone())]) }

/// Applies a trigger's input mapping to a payload: each target field is an expression over
/// the payload; an empty mapping passes the payload through whole.
fn map_input(mapping: &HashMap<String, String>, payload: &Value) -> Value {
    if mapping.is_empty() {
        return payload.clone();
    }

    let scope: HashMap<String, Value> = payload_scope(payload);
    let mut input: serde_json::Map<String, Value> = serde_json::Map::with_capacity(mapping.len());
    for (field, expr) in mapping {
        match expression::evaluate(expr, &scope) {
            Ok(value) => {
                input.insert(field.clone(), value);
            },
            Err(err) => {
                debug!("Input mapping for '{field}' did not resolve ({err}); leaving it null");
                input.insert(field.clone(), Value::Null);
            },
        }
    }
    Value::Object(input)
}

/// Validates a manual submission against the trigger's input schema.
fn validate_input(workflow: &str, schema: &[InputField], input: &Value) -> Result<(), Error> {
    for field in schema {
        let value: Option<&Value> = input.get(&field.name);
        match value {
            None | Some(Value::Null) if field.required => {
                return Err(Error::InputValidation { workflow: workflow.into(), reason: format!("missing required field '{}'", field.name) });
            },
            Some(value) if !field.allowed_values.is_empty() && !field.allowed_values.contains(value) => {
                return Err(Error::InputValidation {
                    workflow: workflow.into(),
                    reason: format!("field '{}' must be one of the allowed values", field.name),
                });
            },
            _ => {},
        }
    }
    Ok(())
}





/***** LIBRARY *****/
/// The trigger service: the bridge between the outside world and workflow starts.
#[derive(Debug)]
pub struct TriggerService {
    /// The engine that starts matched workflows.
    engine: Arc<WorkflowEngine>,
    /// Every registration, keyed by trigger id.
    registrations: DashMap<String, TriggerRegistration>,
    /// Event type -> trigger ids.
    by_event: RwLock<HashMap<String, HashSet<String>>>,
    /// Upper-cased webhook path -> trigger ids.
    by_webhook: RwLock<HashMap<String, HashSet<String>>>,
}
impl TriggerService {
    /// Constructor for the TriggerService.
    ///
    /// # Arguments
    /// - `engine`: The engine matched triggers start workflows on.
    #[inline]
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine, registrations: DashMap::new(), by_event: RwLock::new(HashMap::new()), by_webhook: RwLock::new(HashMap::new()) }
    }

    /// Registers every trigger of the given workflow definition (called at activation).
    ///
    /// Any previous registrations of the same workflow are replaced.
    pub fn activate_workflow(&self, definition: &WorkflowDefinition) {
        self.deactivate_workflow(&definition.id);
        for trigger in &definition.triggers {
            let registration: TriggerRegistration = TriggerRegistration {
                trigger: trigger.clone(),
                workflow_id: definition.id.clone(),
                workflow_version: definition.version.clone(),
            };
            match &trigger.kind {
                TriggerKind::Event { event_type, .. } => {
                    self.by_event.write().entry(event_type.clone()).or_default().insert(trigger.id.clone());
                },
                TriggerKind::Webhook { path, .. } => {
                    self.by_webhook.write().entry(path.to_uppercase()).or_default().insert(trigger.id.clone());
                },
                // Schedule triggers fire through synthetic `schedule:<id>` events
                TriggerKind::Schedule { .. } => {
                    self.by_event.write().entry(format!("schedule:{}", trigger.id)).or_default().insert(trigger.id.clone());
                },
                TriggerKind::Manual { .. } => {},
            }
            self.registrations.insert(trigger.id.clone(), registration);
        }
        info!("Activated {} trigger(s) for workflow '{}'", definition.triggers.len(), definition.id);
    }

    /// Removes every registration of the given workflow (called at deactivation).
    pub fn deactivate_workflow(&self, workflow_id: &str) {
        let removed: Vec<String> = self
            .registrations
            .iter()
            .filter(|entry| entry.workflow_id == workflow_id)
            .map(|entry| entry.key().clone())
            .collect();
        for trigger_id in &removed {
            self.registrations.remove(trigger_id);
        }
        if !removed.is_empty() {
            let removed: HashSet<String> = removed.into_iter().collect();
            self.by_event.write().retain(|_, ids| {
                ids.retain(|id| !removed.contains(id));
                !ids.is_empty()
            });
            self.by_webhook.write().retain(|_, ids| {
                ids.retain(|id| !removed.contains(id));
                !ids.is_empty()
            });
        }
    }

    /// Processes an event: resumes any waiting steps, then starts every workflow whose
    /// enabled event trigger matches.
    ///
    /// # Arguments
    /// - `event_type`: The event's type.
    /// - `data`: The event's payload.
    ///
    /// # Returns
    /// The ids of the instances that were started.
    pub async fn process_event(&self, event_type: &str, data: Value) -> Vec<String> {
        // Parked wait-for-event steps come first
        let resumed: usize = self.engine.deliver_event(event_type, &data);
        if resumed > 0 {
            debug!("Event '{event_type}' resumed {resumed} waiting step(s)");
        }

        let trigger_ids: Vec<String> = self.by_event.read().get(event_type).map(|ids| ids.iter().cloned().collect()).unwrap_or_default();
        let mut started: Vec<String> = Vec::new();
        for trigger_id in trigger_ids {
            let registration: TriggerRegistration = match self.registrations.get(&trigger_id) {
                Some(registration) => registration.clone(),
                None => continue,
            };
            if !registration.trigger.enabled {
                continue;
            }

            // Apply the filter, if any
            if let TriggerKind::Event { filter: Some(filter), .. } = &registration.trigger.kind {
                match expression::evaluate_bool(filter, &payload_scope(&data)) {
                    Ok(true) => {},
                    Ok(false) => continue,
                    Err(err) => {
                        warn!("Filter of trigger '{trigger_id}' failed to evaluate: {err}");
                        continue;
                    },
                }
            }

            let input: Value = map_input(&registration.trigger.input_mapping, &data);
            match self
                .engine
                .start(&registration.workflow_id, Some(&registration.workflow_version), input, Some(trigger_id.clone()), None)
                .await
            {
                Ok(instance) => {
                    info!("Event '{event_type}' started instance '{}' of workflow '{}'", instance.id, registration.workflow_id);
                    started.push(instance.id);
                },
                Err(err) => {
                    warn!("Trigger '{trigger_id}' failed to start workflow '{}': {err}", registration.workflow_id);
                },
            }
        }
        started
    }

    /// Processes an inbound webhook request.
    ///
    /// # Arguments
    /// - `path`: The request path (matched case-insensitively).
    /// - `method`: The HTTP method.
    /// - `body`: The parsed request body.
    /// - `headers`: The request headers, lower-cased keys.
    ///
    /// # Returns
    /// The ids of the instances that were started.
    ///
    /// # Errors
    /// This function errors if a matching trigger's secret or method validation fails.
    pub async fn process_webhook(
        &self,
        path: &str,
        method: &str,
        body: Value,
        headers: &HashMap<String, String>,
    ) -> Result<Vec<String>, Error> {
        let trigger_ids: Vec<String> = self.by_webhook.read().get(&path.to_uppercase()).map(|ids| ids.iter().cloned().collect()).unwrap_or_default();

        let mut started: Vec<String> = Vec::new();
        for trigger_id in trigger_ids {
            let registration: TriggerRegistration = match self.registrations.get(&trigger_id) {
                Some(registration) => registration.clone(),
                None => continue,
            };
            if !registration.trigger.enabled {
                continue;
            }
            let (methods, secret): (&Vec<String>, &Option<String>) = match &registration.trigger.kind {
                TriggerKind::Webhook { methods, secret, .. } => (methods, secret),
                _ => continue,
            };

            // Validate the caller before anything runs
            if let Some(secret) = secret {
                if headers.get(WEBHOOK_SECRET_HEADER).map(String::as_str) != Some(secret.as_str()) {
                    return Err(Error::BadWebhookSecret { path: path.into() });
                }
            }
            if !methods.is_empty() && !methods.iter().any(|allowed| allowed.eq_ignore_ascii_case(method)) {
                return Err(Error::MethodNotAllowed { path: path.into(), method: method.into() });
            }

            let input: Value = map_input(&registration.trigger.input_mapping, &body);
            let instance: WorkflowInstance = self
                .engine
                .start(&registration.workflow_id, Some(&registration.workflow_version), input, Some(trigger_id.clone()), None)
                .await?;
            info!("Webhook '{path}' started instance '{}' of workflow '{}'", instance.id, registration.workflow_id);
            started.push(instance.id);
        }
        Ok(started)
    }

    /// Starts a workflow explicitly, validating the input against the manual trigger's
    /// schema.
    ///
    /// # Arguments
    /// - `workflow_id`: The workflow to start.
    /// - `input`: The caller-provided input.
    /// - `initiated_by`: Who asked (recorded in the logs).
    ///
    /// # Returns
    /// The started instance.
    ///
    /// # Errors
    /// This function errors if the workflow has no manual trigger, the input fails schema
    /// validation, or the start itself fails.
    pub async fn trigger_manually(&self, workflow_id: &str, input: Value, initiated_by: &str) -> Result<WorkflowInstance, Error> {
        let definition: WorkflowDefinition = self.engine.definitions().get(workflow_id, None).await?;
        let manual: &TriggerDefinition = definition
            .triggers
            .iter()
            .find(|trigger| trigger.enabled && matches!(trigger.kind, TriggerKind::Manual { .. }))
            .ok_or_else(|| Error::NoManualTrigger { workflow: workflow_id.into() })?;
        if let TriggerKind::Manual { input_schema } = &manual.kind {
            validate_input(workflow_id, input_schema, &input)?;
        }

        let input: Value = map_input(&manual.input_mapping, &input);
        let instance: WorkflowInstance =
            self.engine.start(workflow_id, Some(&definition.version), input, Some(manual.id.clone()), None).await?;
        info!("Manual start of workflow '{workflow_id}' by '{initiated_by}': instance '{}'", instance.id);
        Ok(instance)
    }

    /// Returns all current registrations.
    pub fn registrations(&self) -> Vec<TriggerRegistration> { self.registrations.iter().map(|entry| entry.clone()).collect() }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use orbitmesh_tsk::manager::{JobManager, JobManagerConfig};
    use orbitmesh_tsk::repository::MemJobRepository;

    use crate::executors::LogNotifier;
    use crate::instance::InstanceStatus;
    use crate::repository::{MemInstanceRepository, MemWorkflowRepository};
    use crate::workflow::{ErrorStrategy, StepConfig, WorkflowStep};

    use super::*;

    /// Builds an engine + trigger service around one stored workflow with the given triggers.
    async fn service(triggers: Vec<TriggerDefinition>) -> (Arc<WorkflowEngine>, TriggerService) {
        let jobs: Arc<JobManager> = Arc::new(JobManager::new(Arc::new(MemJobRepository::new()), JobManagerConfig::default()));
        let engine: Arc<WorkflowEngine> = Arc::new(WorkflowEngine::new(
            Arc::new(MemWorkflowRepository::new()),
            Arc::new(MemInstanceRepository::new()),
            jobs,
            Arc::new(LogNotifier),
        ));

        let definition: WorkflowDefinition = WorkflowDefinition {
            id: "wf".into(),
            name: "Test".into(),
            version: "1.0.0".into(),
            description: String::new(),
            steps: vec![WorkflowStep::new("noop", StepConfig::Transform { expression: "'done'".into() })],
            triggers: triggers.clone(),
            variables: HashMap::new(),
            timeout: None,
            max_retries: 0,
            error_strategy: ErrorStrategy::StopOnFirst,
            is_active: true,
        };
        engine.definitions().store(definition.clone()).await.unwrap();

        let service: TriggerService = TriggerService::new(engine.clone());
        service.activate_workflow(&definition);
        (engine, service)
    }

    #[tokio::test]
    async fn test_event_trigger_with_filter_and_mapping() {
        let (_engine, service) = service(vec![TriggerDefinition {
            id: "on-deploy".into(),
            kind: TriggerKind::Event { event_type: "deploy".into(), filter: Some("$.env == 'prod'".into()) },
            input_mapping: HashMap::from([("target".to_string(), "$.env".to_string())]),
            enabled: true,
        }])
        .await;

        // A non-matching filter starts nothing
        assert!(service.process_event("deploy", serde_json::json!({"env": "staging"})).await.is_empty());
        // Unknown event types start nothing either
        assert!(service.process_event("push", serde_json::json!({"env": "prod"})).await.is_empty());

        let started: Vec<String> = service.process_event("deploy", serde_json::json!({"env": "prod"})).await;
        assert_eq!(started.len(), 1);
        let instance: WorkflowInstance = service.engine.instances().get(&started[0]).await.unwrap().unwrap();
        assert_eq!(instance.input, serde_json::json!({"target": "prod"}));
        assert_eq!(instance.trigger_id.as_deref(), Some("on-deploy"));
    }

    #[tokio::test]
    async fn test_webhook_validation() {
        let (_engine, service) = service(vec![TriggerDefinition {
            id: "hook".into(),
            kind: TriggerKind::Webhook { path: "/hooks/build".into(), methods: vec!["POST".into()], secret: Some("s3cret".into()) },
            input_mapping: HashMap::new(),
            enabled: true,
        }])
        .await;

        // Wrong secret
        let err = service.process_webhook("/hooks/build", "POST", Value::Null, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::BadWebhookSecret { .. }));

        // Wrong method
        let headers: HashMap<String, String> = HashMap::from([(WEBHOOK_SECRET_HEADER.to_string(), "s3cret".to_string())]);
        let err = service.process_webhook("/hooks/build", "DELETE", Value::Null, &headers).await.unwrap_err();
        assert!(matches!(err, Error::MethodNotAllowed { .. }));

        // Correct call, case-insensitive path
        let started: Vec<String> = service.process_webhook("/HOOKS/BUILD", "post", serde_json::json!({"n": 1}), &headers).await.unwrap();
        assert_eq!(started.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_trigger_schema_validation() {
        let (engine, service) = service(vec![TriggerDefinition {
            id: "manual".into(),
            kind: TriggerKind::Manual {
                input_schema: vec![
                    InputField { name: "env".into(), required: true, allowed_values: vec![serde_json::json!("prod"), serde_json::json!("staging")] },
                ],
            },
            input_mapping: HashMap::new(),
            enabled: true,
        }])
        .await;

        // Missing required field
        let err = service.trigger_manually("wf", serde_json::json!({}), "alice").await.unwrap_err();
        assert!(matches!(err, Error::InputValidation { .. }));
        // Disallowed value
        let err = service.trigger_manually("wf", serde_json::json!({"env": "dev"}), "alice").await.unwrap_err();
        assert!(matches!(err, Error::InputValidation { .. }));

        // A valid submission runs to completion
        let instance: WorkflowInstance = service.trigger_manually("wf", serde_json::json!({"env": "prod"}), "alice").await.unwrap();
        for _ in 0..100 {
            if let Some(done) = engine.instances().get(&instance.id).await.unwrap() {
                if done.is_terminal() {
                    assert_eq!(done.status, InstanceStatus::Completed);
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("Instance did not finish");
    }

    #[tokio::test]
    async fn test_deactivation_removes_registrations() {
        let (_engine, service) = service(vec![TriggerDefinition {
            id: "on-x".into(),
            kind: TriggerKind::Event { event_type: "x".into(), filter: None },
            input_mapping: HashMap::new(),
            enabled: true,
        }])
        .await;

        assert_eq!(service.process_event("x", Value::Null).await.len(), 1);
        service.deactivate_workflow("wf");
        assert!(service.process_event("x", Value::Null).await.is_empty());
        assert!(service.registrations().is_empty());
    }
}
