//! Entity and detail definitions.

use crate::path::PropertyPath;
use crate::value::{Record, Value};
use std::sync::Arc;
use tracing::warn;

/// How a field name is held by an entity node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Tracked property with stored/changed values.
    Property,
    /// Opaque detail blob, synced wholesale.
    Detail,
    /// Child collection, by index into [`EntityDefinition::children`].
    Child(usize),
}

/// Definition of an opaque nested blob selected alongside an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailDefinition {
    /// Name of the related entity set.
    pub entity_name: String,
    /// Navigation property name, if it differs from the entity name.
    pub navigation_key: Option<String>,
    /// Fields to select.
    pub keys: Vec<String>,
    /// Fields excluded from selection.
    pub ignored_keys: Vec<String>,
    /// Nested detail expansions.
    pub details: Vec<DetailDefinition>,
}

impl DetailDefinition {
    /// Creates a detail definition.
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            navigation_key: None,
            keys: Vec::new(),
            ignored_keys: Vec::new(),
            details: Vec::new(),
        }
    }

    /// Sets the navigation key.
    pub fn with_navigation_key(mut self, key: impl Into<String>) -> Self {
        self.navigation_key = Some(key.into());
        self
    }

    /// Sets the selected fields.
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the fields excluded from selection.
    pub fn with_ignored_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a nested detail expansion.
    pub fn with_detail(mut self, detail: DetailDefinition) -> Self {
        self.details.push(detail);
        self
    }

    /// Name under which the blob appears in the parent record.
    pub fn navigation(&self) -> &str {
        self.navigation_key.as_deref().unwrap_or(&self.entity_name)
    }
}

/// Immutable description of an entity type and its nested children.
///
/// Definitions are shared through `Arc`; two nodes share a definition iff
/// their `Arc`s point to the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDefinition {
    /// Name of the entity set on the server.
    pub entity_name: String,
    /// Name of the unique identifier field.
    pub primary_key: String,
    /// Navigation property name when nested, if it differs from the entity
    /// name.
    pub navigation_key: Option<String>,
    /// Field written on this entity to reference the parent's primary key.
    pub foreign_key: Option<String>,
    /// Declared tracked properties. Empty means every scalar field is
    /// tracked.
    pub keys: Vec<String>,
    /// Declared properties excluded from `$select`.
    pub ignored_keys: Vec<String>,
    /// Child collections.
    pub children: Vec<Arc<EntityDefinition>>,
    /// Detail blobs.
    pub details: Vec<DetailDefinition>,
    /// Paths of fields coerced from text to date-time on load.
    pub date_keys: Vec<String>,
}

impl EntityDefinition {
    /// Creates a definition with a name and primary key.
    pub fn new(entity_name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            primary_key: primary_key.into(),
            navigation_key: None,
            foreign_key: None,
            keys: Vec::new(),
            ignored_keys: Vec::new(),
            children: Vec::new(),
            details: Vec::new(),
            date_keys: Vec::new(),
        }
    }

    /// Sets the navigation key.
    pub fn with_navigation_key(mut self, key: impl Into<String>) -> Self {
        self.navigation_key = Some(key.into());
        self
    }

    /// Sets the foreign key.
    pub fn with_foreign_key(mut self, key: impl Into<String>) -> Self {
        self.foreign_key = Some(key.into());
        self
    }

    /// Sets the declared tracked properties.
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the properties excluded from selection.
    pub fn with_ignored_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a child definition.
    pub fn with_child(self, child: EntityDefinition) -> Self {
        self.with_shared_child(Arc::new(child))
    }

    /// Adds an already shared child definition.
    pub fn with_shared_child(mut self, child: Arc<EntityDefinition>) -> Self {
        self.children.push(child);
        self
    }

    /// Adds a detail definition.
    pub fn with_detail(mut self, detail: DetailDefinition) -> Self {
        self.details.push(detail);
        self
    }

    /// Sets the date-time field paths.
    pub fn with_date_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.date_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Wraps the definition in an `Arc`.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Name under which this entity appears in a parent record.
    pub fn navigation(&self) -> &str {
        self.navigation_key.as_deref().unwrap_or(&self.entity_name)
    }

    /// Finds a child definition by navigation key.
    pub fn child(&self, navigation: &str) -> Option<&Arc<EntityDefinition>> {
        self.children.iter().find(|c| c.navigation() == navigation)
    }

    /// Classifies a field name.
    pub fn classify(&self, name: &str) -> FieldKind {
        if let Some(index) = self.children.iter().position(|c| c.navigation() == name) {
            return FieldKind::Child(index);
        }
        if self.details.iter().any(|d| d.navigation() == name) {
            return FieldKind::Detail;
        }
        if !self.keys.is_empty() && !self.keys.iter().any(|k| k == name) && name != self.primary_key
        {
            return FieldKind::Detail;
        }
        FieldKind::Property
    }

    /// `$select` list: the primary key, then declared keys minus ignored
    /// keys. `None` when no keys are declared.
    pub fn select_list(&self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let mut selected = vec![self.primary_key.as_str()];
        selected.extend(
            self.keys
                .iter()
                .filter(|k| **k != self.primary_key && !self.ignored_keys.contains(k))
                .map(String::as_str),
        );
        Some(selected.join(","))
    }

    /// Coerces every configured date field of `record`, and of the child
    /// records nested under it, from text to [`Value::DateTime`].
    pub fn coerce_dates(&self, record: &mut Record) {
        for key in &self.date_keys {
            let path = match PropertyPath::parse(key) {
                Ok(path) => path,
                Err(err) => {
                    warn!(entity = %self.entity_name, %key, %err, "skipping invalid date key");
                    continue;
                }
            };
            if path.read(record).is_none() {
                continue;
            }
            let result = path.write(record, |value| match value {
                Value::Text(text) => {
                    let coerced = Value::Text(text).into_datetime();
                    if coerced.as_datetime().is_none() {
                        warn!(entity = %self.entity_name, %key, "unparsable date value");
                    }
                    coerced
                }
                other => other,
            });
            if let Err(err) = result {
                warn!(entity = %self.entity_name, %key, %err, "date coercion skipped");
            }
        }

        for child in &self.children {
            match record.get_mut(child.navigation()) {
                Some(Value::Array(items)) => {
                    for item in items.iter_mut().filter_map(Value::as_object_mut) {
                        child.coerce_dates(item);
                    }
                }
                Some(Value::Object(nested)) => child.coerce_dates(nested),
                _ => {}
            }
        }
    }
}

impl DetailDefinition {
    /// `$select` list: declared keys minus ignored keys.
    pub fn select_list(&self) -> Option<String> {
        let selected = self
            .keys
            .iter()
            .filter(|k| !self.ignored_keys.contains(k))
            .map(String::as_str)
            .collect::<Vec<_>>();
        if selected.is_empty() {
            None
        } else {
            Some(selected.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_definition() -> EntityDefinition {
        EntityDefinition::new("Orders", "OrderID")
            .with_keys(["OrderID", "Name", "OrderDate"])
            .with_date_keys(["OrderDate"])
            .with_detail(DetailDefinition::new("Customers").with_navigation_key("Customer"))
            .with_child(
                EntityDefinition::new("OrderLines", "LineID")
                    .with_navigation_key("Lines")
                    .with_foreign_key("OrderID")
                    .with_date_keys(["ShippedAt"]),
            )
    }

    #[test]
    fn classify_fields() {
        let def = order_definition();
        assert_eq!(def.classify("Name"), FieldKind::Property);
        assert_eq!(def.classify("OrderID"), FieldKind::Property);
        assert_eq!(def.classify("Customer"), FieldKind::Detail);
        assert_eq!(def.classify("Lines"), FieldKind::Child(0));
        // Undeclared fields are held as details when keys are declared
        assert_eq!(def.classify("Comment"), FieldKind::Detail);

        let open = EntityDefinition::new("Notes", "NoteID");
        assert_eq!(open.classify("Comment"), FieldKind::Property);
    }

    #[test]
    fn navigation_defaults_to_entity_name() {
        let def = order_definition();
        assert_eq!(def.navigation(), "Orders");
        assert_eq!(def.children[0].navigation(), "Lines");
        assert!(def.child("Lines").is_some());
        assert!(def.child("OrderLines").is_none());
    }

    #[test]
    fn select_list_excludes_ignored() {
        let def = order_definition().with_ignored_keys(["OrderDate"]);
        assert_eq!(def.select_list().as_deref(), Some("OrderID,Name"));
        assert_eq!(EntityDefinition::new("X", "Id").select_list(), None);
    }

    #[test]
    fn select_list_always_includes_primary_key() {
        let def = EntityDefinition::new("Orders", "OrderID").with_keys(["Name", "Total"]);
        assert_eq!(def.select_list().as_deref(), Some("OrderID,Name,Total"));

        let def = EntityDefinition::new("Orders", "OrderID")
            .with_keys(["Name", "OrderID"])
            .with_ignored_keys(["OrderID"]);
        assert_eq!(def.select_list().as_deref(), Some("OrderID,Name"));
    }

    #[test]
    fn coerce_dates_recurses_into_children() {
        let def = order_definition();
        let mut record = Value::from(json!({
            "OrderID": 1,
            "OrderDate": "2024-05-01T12:00:00Z",
            "Lines": [
                {"LineID": 1, "ShippedAt": "2024-05-02"},
                {"LineID": 2, "ShippedAt": null}
            ]
        }))
        .into_object()
        .unwrap();

        def.coerce_dates(&mut record);

        assert!(record["OrderDate"].as_datetime().is_some());
        let lines = record["Lines"].as_array().unwrap();
        assert!(lines[0].as_object().unwrap()["ShippedAt"].as_datetime().is_some());
        assert!(lines[1].as_object().unwrap()["ShippedAt"].is_null());
    }

    #[test]
    fn coerce_dates_skips_absent_fields() {
        let def = order_definition();
        let mut record = Value::from(json!({"OrderID": 1})).into_object().unwrap();
        def.coerce_dates(&mut record);
        assert!(!record.contains_key("OrderDate"));
    }
}
