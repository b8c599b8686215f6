//! Object model schema loading.
//!
//! Two schema dialects are understood, matching the two identifier styles:
//!
//! - **Named** — items carry only an `identifier`; struct properties list
//!   their fields under `dataType.specs`, events under `outputData`.
//! - **Numeric** — items carry a `code` and a numeric `id`; struct
//!   properties list fields under `specs`, and events reference shared
//!   property structs through `outputData[].$ref` (`#/properties/id/<n>`).
//!
//! Sections other than `properties` and `events` are ignored.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Domain, NestedField, ObjectModel, Permission, WireId};
use crate::error::Error;

/// Identifier style used by a backend's schema and wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireDialect {
    /// Human-readable string identifiers on the wire.
    #[default]
    Named,
    /// Numeric identifiers on the wire.
    Numeric,
}

// ── Named dialect ─────────────────────────────────────────────

#[derive(Deserialize)]
struct NamedSchema {
    #[serde(default)]
    properties: Vec<NamedItem>,
    #[serde(default)]
    events: Vec<NamedItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamedItem {
    identifier: String,
    #[serde(default)]
    access_mode: Option<String>,
    #[serde(default)]
    data_type: Option<NamedDataType>,
    #[serde(default)]
    output_data: Vec<NamedItem>,
}

#[derive(Deserialize)]
struct NamedDataType {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    specs: Value,
}

impl NamedItem {
    /// Struct members, if this item is struct-typed.
    fn struct_specs(&self) -> Result<Vec<NamedItem>, Error> {
        match &self.data_type {
            Some(dt) if dt.kind.eq_ignore_ascii_case("struct") => {
                Vec::<NamedItem>::deserialize(&dt.specs)
                    .map_err(|e| Error::Schema(format!("{}: {}", self.identifier, e)))
            }
            _ => Ok(Vec::new()),
        }
    }
}

fn load_named(json: &str) -> Result<ObjectModel, Error> {
    let schema: NamedSchema =
        serde_json::from_str(json).map_err(|e| Error::Schema(e.to_string()))?;
    let mut model = ObjectModel::new();

    for (domain, items) in [
        (Domain::Property, &schema.properties),
        (Domain::Event, &schema.events),
    ] {
        for item in items {
            let perm = item
                .access_mode
                .as_deref()
                .map_or(Permission::ReadWrite, Permission::parse);
            model.register(domain, &item.identifier, None, perm);

            let members = match domain {
                Domain::Property => item.struct_specs()?,
                Domain::Event => Vec::new(),
            };
            let members = members.iter().chain(item.output_data.iter());
            for member in members {
                let mut sub = BTreeMap::new();
                for leaf in member.struct_specs()? {
                    sub.insert(leaf.identifier.clone(), NestedField::new(leaf.identifier, None));
                }
                model.register_nested_field(domain, &item.identifier, &member.identifier, None, sub)?;
            }
        }
    }
    Ok(model)
}

// ── Numeric dialect ───────────────────────────────────────────

#[derive(Deserialize)]
struct NumericSchema {
    #[serde(default)]
    properties: Vec<NumericItem>,
    #[serde(default)]
    events: Vec<NumericItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NumericItem {
    #[serde(alias = "identifier")]
    code: String,
    #[serde(default)]
    id: Option<WireId>,
    #[serde(default)]
    sub_type: Option<String>,
    #[serde(default)]
    data_type: Option<String>,
    #[serde(default)]
    specs: Value,
    #[serde(default)]
    output_data: Vec<OutputRef>,
}

#[derive(Deserialize)]
struct OutputRef {
    #[serde(rename = "$ref", default)]
    reference: String,
}

impl NumericItem {
    fn struct_specs(&self) -> Result<Vec<NumericItem>, Error> {
        match self.data_type.as_deref() {
            Some(dt) if dt.eq_ignore_ascii_case("struct") => {
                Vec::<NumericItem>::deserialize(&self.specs)
                    .map_err(|e| Error::Schema(format!("{}: {}", self.code, e)))
            }
            _ => Ok(Vec::new()),
        }
    }

    fn nested(&self) -> Result<BTreeMap<String, NestedField>, Error> {
        let mut out = BTreeMap::new();
        for member in self.struct_specs()? {
            let fields = member.nested()?;
            out.insert(
                member.code.clone(),
                NestedField {
                    key: member.code,
                    wire_id: member.id,
                    fields,
                },
            );
        }
        Ok(out)
    }
}

impl OutputRef {
    /// `#/properties/id/12` → `12`.
    fn property_id(&self) -> Option<WireId> {
        self.reference.rsplit('/').next()?.parse().ok()
    }
}

fn load_numeric(json: &str) -> Result<ObjectModel, Error> {
    let schema: NumericSchema =
        serde_json::from_str(json).map_err(|e| Error::Schema(e.to_string()))?;
    let mut model = ObjectModel::new();

    // Properties first so event outputs can resolve their references.
    for item in &schema.properties {
        let perm = item
            .sub_type
            .as_deref()
            .map_or(Permission::ReadWrite, Permission::parse);
        model.register(Domain::Property, &item.code, item.id, perm);
        for (key, field) in item.nested()? {
            model.register_nested_field(Domain::Property, &item.code, &key, field.wire_id, field.fields)?;
        }
    }

    for item in &schema.events {
        let perm = item
            .sub_type
            .as_deref()
            .map_or(Permission::ReadWrite, Permission::parse);
        model.register(Domain::Event, &item.code, item.id, perm);

        for output in &item.output_data {
            let Some(prop_id) = output.property_id() else {
                warn!("schema: event '{}' has unusable $ref '{}'", item.code, output.reference);
                continue;
            };
            let Some((_, prop_key)) = model.reverse_lookup(prop_id) else {
                warn!("schema: event '{}' references unknown property {}", item.code, prop_id);
                continue;
            };
            let prop_key = prop_key.to_owned();
            let shared = model
                .item(Domain::Property, &prop_key)
                .map(|p| {
                    p.fields
                        .iter()
                        .map(|(k, f)| (k.clone(), f.clone()))
                        .collect::<BTreeMap<_, _>>()
                })
                .unwrap_or_default();
            model.register_nested_field(Domain::Event, &item.code, &prop_key, Some(prop_id), shared)?;
        }
    }
    Ok(model)
}

// ── Public entry points ───────────────────────────────────────

impl ObjectModel {
    /// Build a model from a schema document in the given dialect.
    pub fn from_schema(dialect: WireDialect, json: &str) -> Result<Self, Error> {
        let model = match dialect {
            WireDialect::Named => load_named(json)?,
            WireDialect::Numeric => load_numeric(json)?,
        };
        info!("schema: loaded {} items ({:?} dialect)", model.len(), dialect);
        Ok(model)
    }

    /// Read and load a schema file.
    pub fn from_file(dialect: WireDialect, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading object model {}", path.display()))?;
        Self::from_schema(dialect, &raw)
            .with_context(|| format!("loading object model {}", path.display()))
    }
}
