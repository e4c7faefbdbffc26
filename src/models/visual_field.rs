use crate::error::AppError;
use crate::services::clock_service::HybridLogicalClock;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Comment,
    Limitation,
    Deficiency,
}

impl FieldKind {
    pub fn as_str(&self) -> &str {
        match self {
            FieldKind::Comment => "comment",
            FieldKind::Limitation => "limitation",
            FieldKind::Deficiency => "deficiency",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "limitation" | "limitations" => FieldKind::Limitation,
            "deficiency" | "deficiencies" => FieldKind::Deficiency,
            _ => FieldKind::Comment,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            FieldKind::Comment => "Comment",
            FieldKind::Limitation => "Limitation",
            FieldKind::Deficiency => "Deficiency",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    Text,
    Boolean,
    MultiSelect,
}

impl AnswerType {
    pub fn as_str(&self) -> &str {
        match self {
            AnswerType::Text => "text",
            AnswerType::Boolean => "boolean",
            AnswerType::MultiSelect => "multi_select",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "boolean" | "1" => AnswerType::Boolean,
            "multi_select" | "2" => AnswerType::MultiSelect,
            _ => AnswerType::Text,
        }
    }
}

/// Composite key of a checklist item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldKey {
    pub service_id: String,
    pub category: String,
    pub template_id: String,
}

impl FieldKey {
    pub fn new(
        service_id: impl Into<String>,
        category: impl Into<String>,
        template_id: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            category: category.into(),
            template_id: template_id.into(),
        }
    }
}

/// Local state of one checklist item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisualField {
    pub id: Option<i64>,
    pub service_id: String,
    pub category: String,
    pub template_id: String,
    pub template_name: String,
    pub template_text: String,
    pub kind: FieldKind,
    pub answer_type: AnswerType,
    pub answer: Option<String>,
    pub other_value: Option<String>,
    pub selected: bool,
    /// Soft delete on unselect; photos stay attached
    pub hidden: bool,
    pub temp_visual_id: Option<String>,
    pub visual_id: Option<String>,
    pub custom_options: Vec<String>,
    pub rev: i64,
    pub clock: Option<HybridLogicalClock>,
    pub dirty: bool,
    pub updated_at: i64,
}

impl VisualField {
    /// Unselected template row without identifiers
    pub fn new(key: &FieldKey) -> Self {
        Self {
            id: None,
            service_id: key.service_id.clone(),
            category: key.category.clone(),
            template_id: key.template_id.clone(),
            template_name: String::new(),
            template_text: String::new(),
            kind: FieldKind::Comment,
            answer_type: AnswerType::Text,
            answer: None,
            other_value: None,
            selected: false,
            hidden: false,
            temp_visual_id: None,
            visual_id: None,
            custom_options: Vec::new(),
            rev: 0,
            clock: None,
            dirty: false,
            updated_at: 0,
        }
    }

    pub fn key(&self) -> FieldKey {
        FieldKey::new(&self.service_id, &self.category, &self.template_id)
    }

    /// Confirmed id if known, else the temporary one
    pub fn current_id(&self) -> Option<&str> {
        self.visual_id
            .as_deref()
            .or(self.temp_visual_id.as_deref())
    }

    /// Visible as a selected checklist item
    pub fn is_active(&self) -> bool {
        self.selected && !self.hidden
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.service_id.trim().is_empty()
            || self.category.trim().is_empty()
            || self.template_id.trim().is_empty()
        {
            return Err(AppError::Validation(
                "Service, category and template must not be empty".to_string(),
            ));
        }

        if self.selected && self.temp_visual_id.is_none() && self.visual_id.is_none() {
            return Err(AppError::Validation(
                "A selected item needs an identifier".to_string(),
            ));
        }

        Ok(())
    }

    /// Compares everything a user or the server can change
    pub fn same_content(&self, other: &VisualField) -> bool {
        self.template_name == other.template_name
            && self.template_text == other.template_text
            && self.kind == other.kind
            && self.answer_type == other.answer_type
            && self.answer == other.answer
            && self.other_value == other.other_value
            && self.selected == other.selected
            && self.hidden == other.hidden
            && self.temp_visual_id == other.temp_visual_id
            && self.visual_id == other.visual_id
            && self.custom_options == other.custom_options
    }
}

pub(crate) const FIELD_COLUMNS: &str = "id, service_id, category, template_id, template_name,
     template_text, kind, answer_type, answer, other_value, selected, hidden, temp_visual_id,
     visual_id, custom_options, rev, clock, dirty, updated_at";

impl<'r> TryFrom<&Row<'r>> for VisualField {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'r>) -> Result<Self, Self::Error> {
        let kind: String = row.get(6)?;
        let answer_type: String = row.get(7)?;
        let options: String = row.get(14)?;
        let clock: Option<String> = row.get(16)?;

        Ok(VisualField {
            id: Some(row.get(0)?),
            service_id: row.get(1)?,
            category: row.get(2)?,
            template_id: row.get(3)?,
            template_name: row.get(4)?,
            template_text: row.get(5)?,
            kind: FieldKind::from_str(&kind),
            answer_type: AnswerType::from_str(&answer_type),
            answer: row.get(8)?,
            other_value: row.get(9)?,
            selected: row.get(10)?,
            hidden: row.get(11)?,
            temp_visual_id: row.get(12)?,
            visual_id: row.get(13)?,
            custom_options: serde_json::from_str(&options).unwrap_or_default(),
            rev: row.get(15)?,
            clock: clock.and_then(|c| serde_json::from_str(&c).ok()),
            dirty: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }
}

/// Partial update merged onto a stored row
///
/// `None` leaves the stored value alone. For nullable columns the inner
/// `Option` distinguishes "clear" from "keep".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdate {
    pub template_name: Option<String>,
    pub template_text: Option<String>,
    pub kind: Option<FieldKind>,
    pub answer_type: Option<AnswerType>,
    pub answer: Option<Option<String>>,
    pub other_value: Option<Option<String>>,
    pub selected: Option<bool>,
    pub hidden: Option<bool>,
    pub temp_visual_id: Option<String>,
    pub visual_id: Option<String>,
    pub custom_options: Option<Vec<String>>,
    /// Reject the write unless the stored revision matches
    pub expected_rev: Option<i64>,
}

impl FieldUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected(mut self, selected: bool) -> Self {
        self.selected = Some(selected);
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = Some(hidden);
        self
    }

    pub fn answer(mut self, answer: Option<String>) -> Self {
        self.answer = Some(answer);
        self
    }

    pub fn other_value(mut self, other: Option<String>) -> Self {
        self.other_value = Some(other);
        self
    }

    pub fn template(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.template_name = Some(name.into());
        self.template_text = Some(text.into());
        self
    }

    pub fn kind(mut self, kind: FieldKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn answer_type(mut self, answer_type: AnswerType) -> Self {
        self.answer_type = Some(answer_type);
        self
    }

    pub fn temp_visual_id(mut self, id: impl Into<String>) -> Self {
        self.temp_visual_id = Some(id.into());
        self
    }

    pub fn visual_id(mut self, id: impl Into<String>) -> Self {
        self.visual_id = Some(id.into());
        self
    }

    pub fn custom_options(mut self, options: Vec<String>) -> Self {
        self.custom_options = Some(options);
        self
    }

    pub fn expect_rev(mut self, rev: i64) -> Self {
        self.expected_rev = Some(rev);
        self
    }

    pub fn apply_to(&self, field: &mut VisualField) {
        if let Some(v) = &self.template_name {
            field.template_name = v.clone();
        }
        if let Some(v) = &self.template_text {
            field.template_text = v.clone();
        }
        if let Some(v) = self.kind {
            field.kind = v;
        }
        if let Some(v) = self.answer_type {
            field.answer_type = v;
        }
        if let Some(v) = &self.answer {
            field.answer = v.clone();
        }
        if let Some(v) = &self.other_value {
            field.other_value = v.clone();
        }
        if let Some(v) = self.selected {
            field.selected = v;
        }
        if let Some(v) = self.hidden {
            field.hidden = v;
        }
        if let Some(v) = &self.temp_visual_id {
            field.temp_visual_id = Some(v.clone());
        }
        if let Some(v) = &self.visual_id {
            field.visual_id = Some(v.clone());
        }
        if let Some(v) = &self.custom_options {
            field.custom_options = v.clone();
        }
    }
}
