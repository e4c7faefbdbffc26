//! Maps server records onto one canonical shape
//!
//! The backend has renamed columns over time (`Attachment` vs `Photo`,
//! `VisualID` vs `LBWID`, ...). Every name variant is handled here so the
//! rest of the crate only ever sees [`ServerVisual`] and [`ServerAttachment`].

use crate::error::AppError;
use crate::models::{AnswerType, FieldKey, FieldKind, VisualField};
use local_images::LocalImage;
use serde_json::{json, Map, Value};

const VISUAL_ID: &[&str] = &["LBWID", "VisualID", "VisualId", "visualId", "PK_ID", "id"];
const SERVICE_ID: &[&str] = &["ServiceID", "ServiceId", "serviceId", "service_id"];
const CATEGORY: &[&str] = &["Category", "category"];
const TEMPLATE_ID: &[&str] = &["TemplateID", "TemplateId", "templateId", "template_id"];
const NAME: &[&str] = &["Name", "name", "TemplateName"];
const TEXT: &[&str] = &["Text", "text", "Description"];
const KIND: &[&str] = &["Kind", "kind", "Type"];
const ANSWER_TYPE: &[&str] = &["AnswerType", "answerType", "answer_type"];
const ANSWER: &[&str] = &["Answers", "Answer", "answers", "answer"];
const OTHER: &[&str] = &["OtherValue", "Other", "otherValue", "other"];
const HIDDEN: &[&str] = &["Hidden", "hidden", "IsHidden"];
const MODIFIED: &[&str] = &["DateModified", "LastModified", "Modified", "updated_at", "modified_at"];
const CLIENT_REF: &[&str] = &["ClientRef", "TempID", "temp_id"];

const ATTACH_ID: &[&str] = &["AttachID", "AttachId", "attachId", "PK_ID", "id"];
const PHOTO: &[&str] = &["Attachment", "attachment", "Photo", "photo"];
const CAPTION: &[&str] = &["Caption", "caption", "Annotation", "annotation"];
const DRAWINGS: &[&str] = &["Drawings", "drawings"];

/// A visual record as the server holds it
#[derive(Debug, Clone, PartialEq)]
pub struct ServerVisual {
    pub visual_id: String,
    pub service_id: String,
    pub category: String,
    /// Falls back to the template name for records that predate template ids
    pub template_id: String,
    pub name: Option<String>,
    pub text: Option<String>,
    pub kind: Option<FieldKind>,
    pub answer_type: Option<AnswerType>,
    pub answer: Option<String>,
    pub other_value: Option<String>,
    pub hidden: bool,
    /// Milliseconds since epoch
    pub modified_at: Option<i64>,
    /// Temporary id this record was created from, if the server echoes it
    pub client_ref: Option<String>,
}

impl ServerVisual {
    pub fn key(&self) -> FieldKey {
        FieldKey::new(&self.service_id, &self.category, &self.template_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerAttachment {
    pub attach_id: String,
    pub visual_id: String,
    /// Storage key or URL of the uploaded file
    pub photo: Option<String>,
    pub caption: Option<String>,
    pub drawings: Option<String>,
}

fn pick<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|n| obj.get(*n))
        .find(|v| !v.is_null())
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn pick_text(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    pick(obj, names).and_then(text_of)
}

fn flag_of(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        _ => false,
    }
}

/// Accepts epoch milliseconds, RFC 3339 or a naive `YYYY-MM-DDTHH:MM:SS` (UTC)
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<i64>() {
                return Some(ms);
            }
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
                .ok()
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, AppError> {
    value
        .as_object()
        .ok_or_else(|| AppError::Validation("Server record is not an object".to_string()))
}

fn required(obj: &Map<String, Value>, names: &[&str], what: &str) -> Result<String, AppError> {
    pick_text(obj, names)
        .ok_or_else(|| AppError::Validation(format!("Server record has no {}", what)))
}

pub fn normalize_visual(value: &Value) -> Result<ServerVisual, AppError> {
    let obj = as_object(value)?;

    let visual_id = required(obj, VISUAL_ID, "visual id")?;
    let service_id = required(obj, SERVICE_ID, "service id")?;
    let category = required(obj, CATEGORY, "category")?;
    let name = pick_text(obj, NAME);
    let template_id = pick_text(obj, TEMPLATE_ID)
        .or_else(|| name.clone())
        .ok_or_else(|| AppError::Validation("Server record has no template".to_string()))?;

    Ok(ServerVisual {
        visual_id,
        service_id,
        category,
        template_id,
        name,
        text: pick_text(obj, TEXT),
        kind: pick_text(obj, KIND).map(|k| FieldKind::from_str(&k)),
        answer_type: pick_text(obj, ANSWER_TYPE).map(|a| AnswerType::from_str(&a)),
        answer: pick_text(obj, ANSWER),
        other_value: pick_text(obj, OTHER),
        hidden: pick(obj, HIDDEN).map(flag_of).unwrap_or(false),
        modified_at: pick(obj, MODIFIED).and_then(parse_timestamp),
        client_ref: pick_text(obj, CLIENT_REF),
    })
}

pub fn normalize_attachment(value: &Value) -> Result<ServerAttachment, AppError> {
    let obj = as_object(value)?;
    Ok(ServerAttachment {
        attach_id: required(obj, ATTACH_ID, "attachment id")?,
        visual_id: required(obj, VISUAL_ID, "visual id")?,
        photo: pick_text(obj, PHOTO),
        caption: pick_text(obj, CAPTION),
        drawings: pick_text(obj, DRAWINGS),
    })
}

/// Pulls the record id out of a create response
///
/// Responses come as the record itself, `{"Result": [record]}` or
/// `{"Result": record}`.
pub fn extract_record_id(value: &Value, key_names: &[&str]) -> Option<String> {
    let record = match value.get("Result") {
        Some(Value::Array(rows)) => rows.first()?,
        Some(obj @ Value::Object(_)) => obj,
        _ => value,
    };
    let obj = record.as_object()?;
    pick_text(obj, key_names)
}

pub fn visual_id_names() -> &'static [&'static str] {
    VISUAL_ID
}

pub fn attach_id_names() -> &'static [&'static str] {
    ATTACH_ID
}

/// Unwraps a list response into its records
pub fn records_of(value: &Value) -> Vec<Value> {
    match value.get("Result").unwrap_or(value) {
        Value::Array(rows) => rows.clone(),
        obj @ Value::Object(_) => vec![obj.clone()],
        _ => Vec::new(),
    }
}

/// Outgoing body for a visual create or update, canonical names only
pub fn visual_payload(field: &VisualField) -> Value {
    let mut body = json!({
        "ServiceID": field.service_id,
        "Category": field.category,
        "TemplateID": field.template_id,
        "Kind": field.kind.as_str(),
        "AnswerType": field.answer_type.as_str(),
        "Name": field.template_name,
        "Text": field.template_text,
        "Answers": field.answer,
        "OtherValue": field.other_value,
        "Hidden": field.hidden,
    });
    if let (Some(temp), Some(obj)) = (&field.temp_visual_id, body.as_object_mut()) {
        obj.insert("ClientRef".to_string(), json!(temp));
    }
    body
}

/// Outgoing annotation fields of an attachment
pub fn attachment_payload(image: &LocalImage) -> Value {
    json!({
        "Caption": image.caption,
        "Drawings": image.drawings,
    })
}

/// A server visual in outgoing payload names; fields the record lacks are left out
pub fn server_payload(server: &ServerVisual) -> Value {
    let mut body = json!({
        "ServiceID": server.service_id,
        "Category": server.category,
        "TemplateID": server.template_id,
        "Answers": server.answer,
        "OtherValue": server.other_value,
        "Hidden": server.hidden,
    });
    if let Some(obj) = body.as_object_mut() {
        if let Some(kind) = server.kind {
            obj.insert("Kind".to_string(), json!(kind.as_str()));
        }
        if let Some(answer_type) = server.answer_type {
            obj.insert("AnswerType".to_string(), json!(answer_type.as_str()));
        }
        if let Some(name) = &server.name {
            obj.insert("Name".to_string(), json!(name));
        }
        if let Some(text) = &server.text {
            obj.insert("Text".to_string(), json!(text));
        }
    }
    body
}

/// Keys of `local` the server record does not reflect yet
///
/// `None` when the server already holds everything the payload carries.
pub fn unsent_changes(local: &Value, server: &ServerVisual) -> Option<Value> {
    let remote = server_payload(server);
    let local = local.as_object()?;

    let changes: Map<String, Value> = local
        .iter()
        .filter(|(k, _)| k.as_str() != "ClientRef")
        .filter(|(k, v)| {
            let theirs = remote.get(k.as_str());
            theirs != Some(*v) && !(is_blank(Some(*v)) && is_blank(theirs))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if changes.is_empty() {
        None
    } else {
        Some(Value::Object(changes))
    }
}

/// Empty text reads back as a missing field
fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}
