//! Loading topic and subscription definitions from authored documents.
//!
//! Topics arrive in two wire shapes: the first-class `SubscriptionTopic`
//! resource, and the older extension-carrying `Basic` resource used by
//! record models that predate it. `topic_from_document` detects the
//! canonical-URL carrier and selects the parser; neither variant's shape
//! leaks past this module.

use serde_json::{Value, json};
use std::collections::HashMap;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{
    ChannelConfig, ContentLevel, DEFAULT_CONTENT_TYPE, DEFAULT_TIMEOUT_SECONDS, FilterClause,
    FilterComparator, FilterDefinition, FilterModifier, NotificationShape, QueryCriteria,
    QueryResultBehavior, SubscriptionDef, SubscriptionStatus, TopicDef, TriggerDef,
    TriggerInteraction,
};

/// Extension URL carrying the canonical topic URL on `Basic` documents.
const BASIC_TOPIC_URL_EXT: &str = "http://lumenfhir.dev/fhir/StructureDefinition/topic-url";
/// Extension URL carrying one trigger definition on `Basic` documents.
const BASIC_TRIGGER_EXT: &str = "http://lumenfhir.dev/fhir/StructureDefinition/topic-trigger";

/// Whether a document carries a topic definition in either wire shape.
pub fn is_topic_document(document: &Value) -> bool {
    match document.get("resourceType").and_then(|v| v.as_str()) {
        Some("SubscriptionTopic") => true,
        Some("Basic") => basic_topic_url(document).is_some(),
        _ => false,
    }
}

/// Load a topic definition from an authored document, whatever its variant.
pub fn topic_from_document(document: &Value) -> SubscriptionResult<TopicDef> {
    match document.get("resourceType").and_then(|v| v.as_str()) {
        Some("SubscriptionTopic") => parse_subscription_topic(document),
        Some("Basic") if basic_topic_url(document).is_some() => parse_basic_topic(document),
        Some("Basic") => Err(SubscriptionError::validation(
            "Basic document carries no topic-url extension",
        )),
        other => Err(SubscriptionError::validation(format!(
            "document of type {other:?} is not a subscription topic"
        ))),
    }
}

// -----------------------------------------------------------------------------
// First-class SubscriptionTopic variant
// -----------------------------------------------------------------------------

fn parse_subscription_topic(resource: &Value) -> SubscriptionResult<TopicDef> {
    let url = resource
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SubscriptionError::validation("SubscriptionTopic missing url"))?
        .to_string();

    let title = str_field(resource, "title");

    let triggers = resource
        .get("resourceTrigger")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(parse_resource_trigger).collect())
        .unwrap_or_default();

    let can_filter_by = resource
        .get("canFilterBy")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(parse_filter_definition).collect())
        .unwrap_or_default();

    let notification_shape = resource
        .get("notificationShape")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(parse_notification_shape).collect())
        .unwrap_or_default();

    Ok(TopicDef {
        url,
        title,
        triggers,
        can_filter_by,
        notification_shape,
    })
}

fn parse_resource_trigger(trigger: &Value) -> Option<TriggerDef> {
    let resource_type = trigger.get("resource").and_then(|v| v.as_str())?.to_string();

    let interactions = trigger
        .get("supportedInteraction")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(TriggerInteraction::from)
                .collect()
        })
        .unwrap_or_else(|| {
            vec![
                TriggerInteraction::Create,
                TriggerInteraction::Update,
                TriggerInteraction::Delete,
            ]
        });

    let query_criteria = trigger.get("queryCriteria").map(parse_query_criteria);

    let path_criteria = str_field(trigger, "fhirPathCriteria");

    Some(TriggerDef {
        resource_type,
        interactions,
        query_criteria,
        path_criteria,
        description: str_field(trigger, "description"),
    })
}

fn parse_query_criteria(criteria: &Value) -> QueryCriteria {
    QueryCriteria {
        previous: str_field(criteria, "previous"),
        current: str_field(criteria, "current"),
        result_for_create: parse_result_behavior(criteria.get("resultForCreate")),
        result_for_delete: parse_result_behavior(criteria.get("resultForDelete")),
        require_both: criteria
            .get("requireBoth")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
    }
}

fn parse_result_behavior(value: Option<&Value>) -> QueryResultBehavior {
    match value.and_then(|v| v.as_str()) {
        Some("test-fails") | Some("fails") => QueryResultBehavior::Fails,
        _ => QueryResultBehavior::Passes,
    }
}

fn parse_filter_definition(filter: &Value) -> Option<FilterDefinition> {
    Some(FilterDefinition {
        filter_parameter: filter
            .get("filterParameter")
            .and_then(|v| v.as_str())?
            .to_string(),
        resource: str_field(filter, "resource"),
        description: str_field(filter, "description"),
    })
}

fn parse_notification_shape(shape: &Value) -> Option<NotificationShape> {
    Some(NotificationShape {
        resource: shape.get("resource").and_then(|v| v.as_str())?.to_string(),
        include: shape
            .get("include")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
    })
}

// -----------------------------------------------------------------------------
// Extension-carrying Basic variant
// -----------------------------------------------------------------------------

fn basic_topic_url(resource: &Value) -> Option<String> {
    extensions(resource)
        .iter()
        .find(|ext| ext.get("url").and_then(|v| v.as_str()) == Some(BASIC_TOPIC_URL_EXT))
        .and_then(|ext| ext.get("valueUri").and_then(|v| v.as_str()))
        .map(String::from)
}

fn parse_basic_topic(resource: &Value) -> SubscriptionResult<TopicDef> {
    let url = basic_topic_url(resource)
        .ok_or_else(|| SubscriptionError::validation("Basic topic missing url extension"))?;

    let triggers: Vec<TriggerDef> = extensions(resource)
        .iter()
        .filter(|ext| ext.get("url").and_then(|v| v.as_str()) == Some(BASIC_TRIGGER_EXT))
        .filter_map(|ext| parse_basic_trigger(ext))
        .collect();

    Ok(TopicDef {
        url,
        title: resource
            .get("code")
            .and_then(|c| c.get("text"))
            .and_then(|v| v.as_str())
            .map(String::from),
        triggers,
        // The Basic variant predates declared filters and shapes.
        can_filter_by: Vec::new(),
        notification_shape: Vec::new(),
    })
}

fn parse_basic_trigger(ext: &Value) -> Option<TriggerDef> {
    let sub = |name: &str| -> Option<&Value> {
        ext.get("extension")?
            .as_array()?
            .iter()
            .find(|e| e.get("url").and_then(|v| v.as_str()) == Some(name))
    };
    let sub_str =
        |name: &str| sub(name).and_then(|e| e.get("valueString").and_then(|v| v.as_str()));

    let resource_type = sub_str("resource")?.to_string();

    let interactions = sub("supportedInteraction")
        .and_then(|e| e.get("valueString").and_then(|v| v.as_str()))
        .map(|joined| joined.split(',').map(TriggerInteraction::from).collect())
        .unwrap_or_else(|| {
            vec![
                TriggerInteraction::Create,
                TriggerInteraction::Update,
                TriggerInteraction::Delete,
            ]
        });

    let previous = sub_str("queryCriteriaPrevious").map(String::from);
    let current = sub_str("queryCriteriaCurrent").map(String::from);
    let query_criteria = if previous.is_some() || current.is_some() {
        Some(QueryCriteria {
            previous,
            current,
            result_for_create: parse_result_behavior(
                sub("resultForCreate").and_then(|e| e.get("valueString")),
            ),
            result_for_delete: parse_result_behavior(
                sub("resultForDelete").and_then(|e| e.get("valueString")),
            ),
            require_both: sub("requireBoth")
                .and_then(|e| e.get("valueBoolean"))
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
        })
    } else {
        None
    };

    Some(TriggerDef {
        resource_type,
        interactions,
        query_criteria,
        path_criteria: sub_str("pathCriteria").map(String::from),
        description: None,
    })
}

fn extensions(resource: &Value) -> Vec<&Value> {
    resource
        .get("extension")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().collect())
        .unwrap_or_default()
}

// -----------------------------------------------------------------------------
// Subscription resources
// -----------------------------------------------------------------------------

/// Parse a Subscription resource into its runtime definition.
pub fn subscription_from_resource(resource: &Value) -> SubscriptionResult<SubscriptionDef> {
    if resource.get("resourceType").and_then(|v| v.as_str()) != Some("Subscription") {
        return Err(SubscriptionError::validation(
            "document is not a Subscription resource",
        ));
    }

    let topic_url = resource
        .get("topic")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SubscriptionError::validation("Subscription missing topic"))?
        .to_string();

    let id = str_field(resource, "id");

    let channel = parse_channel(resource)?;
    let filters = parse_filter_by(resource)?;

    Ok(SubscriptionDef {
        id,
        topic_url,
        filters,
        channel,
    })
}

fn parse_channel(resource: &Value) -> SubscriptionResult<ChannelConfig> {
    let channel_type = resource
        .get("channelType")
        .ok_or_else(|| SubscriptionError::validation("Subscription missing channelType"))?;

    let code = channel_type
        .get("code")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SubscriptionError::validation("channelType missing code"))?
        .to_string();

    let system = channel_type
        .get("system")
        .and_then(|v| v.as_str())
        .map(String::from);

    let endpoint = str_field(resource, "endpoint");

    // Headers arrive as "Name: value" strings.
    let headers: Vec<(String, String)> = resource
        .get("header")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|h| {
                    let s = h.as_str()?;
                    let (key, value) = s.split_once(':')?;
                    Some((key.trim().to_string(), value.trim().to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    let content_level = resource
        .get("content")
        .and_then(|v| v.as_str())
        .map(|s| {
            ContentLevel::parse(s).ok_or_else(|| {
                SubscriptionError::validation(format!("unknown content level '{s}'"))
            })
        })
        .transpose()?
        .unwrap_or_default();

    let content_type = resource
        .get("contentType")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    let heartbeat_seconds = resource
        .get("heartbeatPeriod")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    let timeout_seconds = resource
        .get("timeout")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .unwrap_or(DEFAULT_TIMEOUT_SECONDS);

    let max_events_per_notification = resource
        .get("maxCount")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    Ok(ChannelConfig {
        system,
        code,
        endpoint,
        headers,
        content_type,
        content_level,
        heartbeat_seconds,
        timeout_seconds,
        max_events_per_notification,
    })
}

fn parse_filter_by(
    resource: &Value,
) -> SubscriptionResult<HashMap<String, Vec<FilterClause>>> {
    let mut filters: HashMap<String, Vec<FilterClause>> = HashMap::new();

    let Some(filter_by) = resource.get("filterBy").and_then(|v| v.as_array()) else {
        return Ok(filters);
    };

    for entry in filter_by {
        let name = entry
            .get("filterParameter")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SubscriptionError::validation("filterBy entry missing filterParameter"))?
            .to_string();
        let value = entry
            .get("value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SubscriptionError::validation("filterBy entry missing value"))?
            .to_string();

        let comparator = match entry.get("comparator").and_then(|v| v.as_str()) {
            Some(c) => FilterComparator::parse(c).ok_or_else(|| {
                SubscriptionError::validation(format!("unknown comparator '{c}'"))
            })?,
            None => FilterComparator::Eq,
        };

        let modifier = entry
            .get("modifier")
            .and_then(|v| v.as_str())
            .map(|m| {
                FilterModifier::parse(m)
                    .ok_or_else(|| SubscriptionError::validation(format!("unknown modifier '{m}'")))
            })
            .transpose()?;

        let resource_type = entry
            .get("resourceType")
            .and_then(|v| v.as_str())
            .unwrap_or("*")
            .to_string();

        filters.entry(resource_type).or_default().push(FilterClause {
            name,
            comparator,
            modifier,
            value,
        });
    }

    Ok(filters)
}

/// Render a subscription back into its stored resource representation.
pub fn render_subscription(def: &SubscriptionDef, id: &str, status: SubscriptionStatus) -> Value {
    let filter_by: Vec<Value> = def
        .filters
        .iter()
        .flat_map(|(resource_type, clauses)| {
            clauses.iter().map(move |clause| {
                let mut entry = json!({
                    "filterParameter": clause.name,
                    "comparator": match clause.comparator {
                        FilterComparator::Eq => "eq",
                        FilterComparator::Ne => "ne",
                        FilterComparator::Gt => "gt",
                        FilterComparator::Ge => "ge",
                        FilterComparator::Lt => "lt",
                        FilterComparator::Le => "le",
                    },
                    "value": clause.value,
                });
                if resource_type != "*" {
                    entry["resourceType"] = json!(resource_type);
                }
                if let Some(modifier) = clause.modifier {
                    entry["modifier"] = json!(match modifier {
                        FilterModifier::Contains => "contains",
                        FilterModifier::Missing => "missing",
                    });
                }
                entry
            })
        })
        .collect();

    let mut resource = json!({
        "resourceType": "Subscription",
        "id": id,
        "status": status.as_str(),
        "topic": def.topic_url,
        "channelType": {
            "code": def.channel.code,
        },
        "contentType": def.channel.content_type,
        "content": def.channel.content_level.as_str(),
        "timeout": def.channel.timeout_seconds,
    });

    if let Some(system) = &def.channel.system {
        resource["channelType"]["system"] = json!(system);
    }
    if let Some(endpoint) = &def.channel.endpoint {
        resource["endpoint"] = json!(endpoint);
    }
    if !def.channel.headers.is_empty() {
        resource["header"] = json!(
            def.channel
                .headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
        );
    }
    if let Some(heartbeat) = def.channel.heartbeat_seconds {
        resource["heartbeatPeriod"] = json!(heartbeat);
    }
    if let Some(max_count) = def.channel.max_events_per_notification {
        resource["maxCount"] = json!(max_count);
    }
    if !filter_by.is_empty() {
        resource["filterBy"] = json!(filter_by);
    }

    resource
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(|v| v.as_str()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription_topic_doc() -> Value {
        json!({
            "resourceType": "SubscriptionTopic",
            "id": "encounter-complete",
            "url": "http://example.org/FHIR/SubscriptionTopic/encounter-complete",
            "title": "Encounter completed",
            "status": "active",
            "resourceTrigger": [{
                "resource": "Encounter",
                "supportedInteraction": ["create", "update"],
                "queryCriteria": {
                    "previous": "status:not=completed",
                    "current": "status=completed",
                    "resultForCreate": "test-passes",
                    "resultForDelete": "test-fails",
                    "requireBoth": true
                }
            }],
            "canFilterBy": [{
                "filterParameter": "subject.reference",
                "resource": "Encounter",
                "description": "Filter by patient"
            }],
            "notificationShape": [{
                "resource": "Encounter",
                "include": ["subject.reference"]
            }]
        })
    }

    #[test]
    fn test_parse_subscription_topic() {
        let topic = topic_from_document(&subscription_topic_doc()).unwrap();
        assert_eq!(
            topic.url,
            "http://example.org/FHIR/SubscriptionTopic/encounter-complete"
        );
        assert_eq!(topic.triggers.len(), 1);

        let trigger = &topic.triggers[0];
        assert_eq!(trigger.resource_type, "Encounter");
        assert_eq!(
            trigger.interactions,
            vec![TriggerInteraction::Create, TriggerInteraction::Update]
        );

        let criteria = trigger.query_criteria.as_ref().unwrap();
        assert_eq!(criteria.previous.as_deref(), Some("status:not=completed"));
        assert_eq!(criteria.current.as_deref(), Some("status=completed"));
        assert_eq!(criteria.result_for_delete, QueryResultBehavior::Fails);
        assert!(criteria.require_both);

        assert_eq!(topic.can_filter_by.len(), 1);
        assert_eq!(topic.notification_shape[0].include, vec!["subject.reference"]);
    }

    #[test]
    fn test_parse_topic_defaults() {
        let doc = json!({
            "resourceType": "SubscriptionTopic",
            "url": "http://example.org/topics/minimal",
            "resourceTrigger": [{"resource": "Patient"}]
        });
        let topic = topic_from_document(&doc).unwrap();
        let trigger = &topic.triggers[0];
        // Unspecified interactions default to all three.
        assert_eq!(trigger.interactions.len(), 3);
        assert!(trigger.query_criteria.is_none());
        assert!(trigger.path_criteria.is_none());
    }

    #[test]
    fn test_parse_basic_variant() {
        let doc = json!({
            "resourceType": "Basic",
            "id": "old-style-topic",
            "code": {"text": "Patient admissions"},
            "extension": [
                {
                    "url": BASIC_TOPIC_URL_EXT,
                    "valueUri": "http://example.org/topics/admissions"
                },
                {
                    "url": BASIC_TRIGGER_EXT,
                    "extension": [
                        {"url": "resource", "valueString": "Encounter"},
                        {"url": "supportedInteraction", "valueString": "create,update"},
                        {"url": "queryCriteriaCurrent", "valueString": "status=in-progress"}
                    ]
                }
            ]
        });

        let topic = topic_from_document(&doc).unwrap();
        assert_eq!(topic.url, "http://example.org/topics/admissions");
        assert_eq!(topic.title.as_deref(), Some("Patient admissions"));
        assert_eq!(topic.triggers.len(), 1);
        assert_eq!(topic.triggers[0].resource_type, "Encounter");
        assert_eq!(
            topic.triggers[0]
                .query_criteria
                .as_ref()
                .unwrap()
                .current
                .as_deref(),
            Some("status=in-progress")
        );
    }

    #[test]
    fn test_reject_non_topic_documents() {
        assert!(topic_from_document(&json!({"resourceType": "Patient"})).is_err());
        assert!(topic_from_document(&json!({"resourceType": "Basic", "id": "x"})).is_err());
        assert!(
            topic_from_document(&json!({"resourceType": "SubscriptionTopic", "id": "no-url"}))
                .is_err()
        );
    }

    #[test]
    fn test_parse_subscription() {
        let doc = json!({
            "resourceType": "Subscription",
            "id": "s1",
            "status": "requested",
            "topic": "http://example.org/topics/admissions",
            "channelType": {"system": "http://terminology.hl7.org/CodeSystem/subscription-channel-type", "code": "rest-hook"},
            "endpoint": "https://receiver.example.com/hook",
            "header": ["Authorization: Bearer abc123"],
            "contentType": "application/fhir+json",
            "content": "id-only",
            "heartbeatPeriod": 600,
            "timeout": 15,
            "maxCount": 10,
            "filterBy": [{
                "resourceType": "Encounter",
                "filterParameter": "subject.reference",
                "comparator": "eq",
                "value": "Patient/p1"
            }]
        });

        let def = subscription_from_resource(&doc).unwrap();
        assert_eq!(def.id.as_deref(), Some("s1"));
        assert_eq!(def.topic_url, "http://example.org/topics/admissions");
        assert_eq!(def.channel.code, "rest-hook");
        assert_eq!(
            def.channel.endpoint.as_deref(),
            Some("https://receiver.example.com/hook")
        );
        assert_eq!(
            def.channel.headers,
            vec![("Authorization".to_string(), "Bearer abc123".to_string())]
        );
        assert_eq!(def.channel.content_level, ContentLevel::IdOnly);
        assert_eq!(def.channel.heartbeat_seconds, Some(600));
        assert_eq!(def.channel.timeout_seconds, 15);
        assert_eq!(def.channel.max_events_per_notification, Some(10));

        let clauses = &def.filters["Encounter"];
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].name, "subject.reference");
        assert_eq!(clauses[0].value, "Patient/p1");
    }

    #[test]
    fn test_parse_subscription_defaults() {
        let doc = json!({
            "resourceType": "Subscription",
            "topic": "http://example.org/topics/t",
            "channelType": {"code": "websocket"}
        });
        let def = subscription_from_resource(&doc).unwrap();
        assert!(def.id.is_none());
        assert!(def.channel.endpoint.is_none());
        assert_eq!(def.channel.content_level, ContentLevel::IdOnly);
        assert_eq!(def.channel.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert!(def.filters.is_empty());
    }

    #[test]
    fn test_parse_subscription_rejections() {
        assert!(subscription_from_resource(&json!({"resourceType": "Patient"})).is_err());
        assert!(
            subscription_from_resource(&json!({
                "resourceType": "Subscription",
                "channelType": {"code": "rest-hook"}
            }))
            .is_err()
        );
        assert!(
            subscription_from_resource(&json!({
                "resourceType": "Subscription",
                "topic": "http://example.org/topics/t",
                "channelType": {"code": "rest-hook"},
                "content": "everything"
            }))
            .is_err()
        );
        assert!(
            subscription_from_resource(&json!({
                "resourceType": "Subscription",
                "topic": "http://example.org/topics/t",
                "channelType": {"code": "rest-hook"},
                "filterBy": [{"filterParameter": "status", "comparator": "approx", "value": "x"}]
            }))
            .is_err()
        );
    }

    #[test]
    fn test_render_roundtrip() {
        let doc = json!({
            "resourceType": "Subscription",
            "id": "s1",
            "topic": "http://example.org/topics/t",
            "channelType": {"code": "rest-hook"},
            "endpoint": "https://receiver.example.com/hook",
            "content": "full-resource",
            "maxCount": 5,
            "filterBy": [{
                "filterParameter": "status",
                "value": "final"
            }]
        });

        let def = subscription_from_resource(&doc).unwrap();
        let rendered = render_subscription(&def, "s1", SubscriptionStatus::Requested);
        assert_eq!(rendered["status"], "requested");
        assert_eq!(rendered["content"], "full-resource");
        assert_eq!(rendered["maxCount"], 5);

        let reparsed = subscription_from_resource(&rendered).unwrap();
        assert_eq!(reparsed.topic_url, def.topic_url);
        assert_eq!(reparsed.channel.content_level, def.channel.content_level);
        assert_eq!(reparsed.filters, def.filters);
    }
}
