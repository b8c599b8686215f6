//! Object model codec — semantic keys ↔ wire identifiers.
//!
//! ```text
//!   "energy" ──encode──▶ "4"        {"local_time": 1}  ──▶ {"19": 1}
//!   "4"      ──decode──▶ "energy"   {"19": 1}          ──▶ {"local_time": 1}
//! ```
//!
//! Backends with string identifiers register items without a wire id, so
//! `encode` leaves keys untouched for them. Backends with numeric
//! identifiers register every item and struct field with its id, and the
//! reverse index makes inbound payloads readable again. Everything above
//! this module deals in semantic keys only.

pub mod schema;

use std::collections::{BTreeMap, HashMap};

use log::debug;
use serde_json::{Map, Value};

use crate::error::Error;

/// Numeric wire identifier assigned by the cloud's object model.
pub type WireId = u32;

/// Which half of the object model an item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Property,
    Event,
}

/// Access kind declared for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl Permission {
    /// Parse the schema's access string (`"rw"`, `"r"`, `"RW"`, `"w"` ...).
    /// Anything unrecognised is treated as read-write.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "r" | "ro" => Self::ReadOnly,
            "w" | "wo" => Self::WriteOnly,
            _ => Self::ReadWrite,
        }
    }
}

/// A field inside a struct-typed item, possibly a struct itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NestedField {
    pub key: String,
    pub wire_id: Option<WireId>,
    pub fields: BTreeMap<String, NestedField>,
}

impl NestedField {
    pub fn new(key: impl Into<String>, wire_id: Option<WireId>) -> Self {
        Self {
            key: key.into(),
            wire_id,
            fields: BTreeMap::new(),
        }
    }

    fn wire_key(&self) -> String {
        wire_key(&self.key, self.wire_id)
    }
}

/// One declared property or event.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectModelItem {
    pub domain: Domain,
    pub key: String,
    pub wire_id: Option<WireId>,
    pub permission: Permission,
    pub fields: BTreeMap<String, NestedField>,
}

impl ObjectModelItem {
    /// Key this item travels under on the wire.
    pub fn wire_key(&self) -> String {
        wire_key(&self.key, self.wire_id)
    }
}

#[derive(Debug, Default)]
struct Table {
    items: BTreeMap<String, ObjectModelItem>,
    by_wire: HashMap<WireId, String>,
}

/// Bidirectional codec over the declared properties and events.
#[derive(Debug, Default)]
pub struct ObjectModel {
    properties: Table,
    events: Table,
}

impl ObjectModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an item. Last write wins, including the reverse
    /// index entry for `wire_id`.
    pub fn register(
        &mut self,
        domain: Domain,
        key: &str,
        wire_id: Option<WireId>,
        permission: Permission,
    ) {
        let table = self.table_mut(domain);

        if let Some(old) = table.items.get(key).and_then(|item| item.wire_id) {
            if table.by_wire.get(&old).is_some_and(|k| k == key) {
                table.by_wire.remove(&old);
            }
        }
        if let Some(id) = wire_id {
            table.by_wire.insert(id, key.to_owned());
        }

        table.items.insert(
            key.to_owned(),
            ObjectModelItem {
                domain,
                key: key.to_owned(),
                wire_id,
                permission,
                fields: BTreeMap::new(),
            },
        );
    }

    /// Drop an item and its reverse index entry.
    ///
    /// The wire id is only unmapped while it still points at `key`; a later
    /// registration that took the id over keeps it.
    pub fn remove(&mut self, domain: Domain, key: &str) -> Option<ObjectModelItem> {
        let table = self.table_mut(domain);
        let item = table.items.remove(key)?;
        if let Some(id) = item.wire_id {
            if table.by_wire.get(&id).is_some_and(|k| k == key) {
                table.by_wire.remove(&id);
            }
        }
        debug!("model: removed {:?} item {}", domain, key);
        Some(item)
    }

    /// Attach a struct field mapping to an already registered item.
    pub fn register_nested_field(
        &mut self,
        domain: Domain,
        key: &str,
        field_key: &str,
        field_wire_id: Option<WireId>,
        field_struct: BTreeMap<String, NestedField>,
    ) -> Result<(), Error> {
        let item = self
            .table_mut(domain)
            .items
            .get_mut(key)
            .ok_or_else(|| Error::UnknownKey(key.to_owned()))?;

        item.fields.insert(
            field_key.to_owned(),
            NestedField {
                key: field_key.to_owned(),
                wire_id: field_wire_id,
                fields: field_struct,
            },
        );
        Ok(())
    }

    /// Find an item by semantic key. Properties shadow events.
    pub fn lookup(&self, key: &str) -> Option<&ObjectModelItem> {
        self.properties
            .items
            .get(key)
            .or_else(|| self.events.items.get(key))
    }

    pub fn item(&self, domain: Domain, key: &str) -> Option<&ObjectModelItem> {
        self.table(domain).items.get(key)
    }

    pub fn domain_of(&self, key: &str) -> Option<Domain> {
        self.lookup(key).map(|item| item.domain)
    }

    /// Declared event keys, in key order.
    pub fn event_keys(&self) -> impl Iterator<Item = &str> {
        self.events.items.keys().map(String::as_str)
    }

    /// Wire keys of the declared events, used for per-event topics.
    pub fn event_wire_keys(&self) -> Vec<String> {
        self.events.items.values().map(ObjectModelItem::wire_key).collect()
    }

    pub fn len(&self) -> usize {
        self.properties.items.len() + self.events.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Translate a semantic key and value into their wire form.
    ///
    /// Known struct fields are renamed to their wire ids (recursively);
    /// unknown fields pass through unchanged.
    pub fn encode(&self, key: &str, value: &Value) -> Result<(String, Value), Error> {
        let item = self
            .lookup(key)
            .ok_or_else(|| Error::UnknownKey(key.to_owned()))?;
        Ok((item.wire_key(), encode_fields(&item.fields, value)))
    }

    /// Inverse of [`encode`](Self::encode) for inbound payloads.
    ///
    /// Returns `None` when the wire key maps to nothing.
    pub fn decode(&self, wire: &str, value: &Value) -> Option<(String, Value)> {
        let item = match wire.parse::<WireId>() {
            Ok(id) => {
                let (domain, key) = self.reverse_lookup(id)?;
                self.item(domain, key)?
            }
            Err(_) => self.lookup(wire)?,
        };
        Some((item.key.clone(), decode_fields(&item.fields, value)))
    }

    /// Semantic key for a numeric wire id. A miss is silent.
    pub fn reverse_lookup(&self, wire_id: WireId) -> Option<(Domain, &str)> {
        if let Some(key) = self.properties.by_wire.get(&wire_id) {
            return Some((Domain::Property, key.as_str()));
        }
        if let Some(key) = self.events.by_wire.get(&wire_id) {
            return Some((Domain::Event, key.as_str()));
        }
        debug!("model: no item for wire id {}", wire_id);
        None
    }

    fn table(&self, domain: Domain) -> &Table {
        match domain {
            Domain::Property => &self.properties,
            Domain::Event => &self.events,
        }
    }

    fn table_mut(&mut self, domain: Domain) -> &mut Table {
        match domain {
            Domain::Property => &mut self.properties,
            Domain::Event => &mut self.events,
        }
    }
}

fn wire_key(key: &str, wire_id: Option<WireId>) -> String {
    wire_id.map_or_else(|| key.to_owned(), |id| id.to_string())
}

fn encode_fields(fields: &BTreeMap<String, NestedField>, value: &Value) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    let mut out = Map::with_capacity(map.len());
    for (k, v) in map {
        match fields.get(k) {
            Some(field) => {
                out.insert(field.wire_key(), encode_fields(&field.fields, v));
            }
            None => {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

fn decode_fields(fields: &BTreeMap<String, NestedField>, value: &Value) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    let mut out = Map::with_capacity(map.len());
    for (k, v) in map {
        let field = fields
            .values()
            .find(|f| f.wire_key() == *k)
            .or_else(|| fields.get(k));
        match field {
            Some(field) => {
                out.insert(field.key.clone(), decode_fields(&field.fields, v));
            }
            None => {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}
