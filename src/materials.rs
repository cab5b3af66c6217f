//! Material logs, the log form's selection state, and the quick-select catalog

use crate::error::{Error, Result};
use crate::models::{
    MaterialItem, MaterialLog, NewMaterialItem, NewMaterialLog, NewQuickSelectMaterial,
    QuickSelectMaterial, SelectedMaterial,
};
use crate::store::{decode, encode, insert_record, Collection, RecordStore, Row};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::info;

const QUANTITY_STEP: f64 = 0.5;
const MIN_STEPPED_QUANTITY: f64 = 0.5;
const DEFAULT_QUANTITY: f64 = 1.0;

/// Materials picked for a new log, keyed by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialSelection {
    items: Vec<SelectedMaterial>,
}

impl MaterialSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[SelectedMaterial] {
        &self.items
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.items.iter().any(|item| item.name == name)
    }

    /// Adds the material at quantity 1, or removes it if already picked.
    pub fn toggle(&mut self, name: &str, unit: &str) {
        if self.is_selected(name) {
            self.remove(name);
        } else {
            self.items
                .push(SelectedMaterial::new(name, DEFAULT_QUANTITY, unit));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.items.retain(|item| item.name != name);
    }

    /// Replaces the entry with the same name.
    pub fn update(&mut self, updated: SelectedMaterial) {
        if let Some(item) = self.items.iter_mut().find(|item| item.name == updated.name) {
            *item = updated;
        }
    }

    pub fn increment(&mut self, name: &str) {
        if let Some(item) = self.find_mut(name) {
            item.quantity += QUANTITY_STEP;
        }
    }

    /// Steps down by 0.5 but never below 0.5.
    pub fn decrement(&mut self, name: &str) {
        if let Some(item) = self.find_mut(name) {
            item.quantity = (item.quantity - QUANTITY_STEP).max(MIN_STEPPED_QUANTITY);
        }
    }

    /// Applies a typed quantity; negative or non-numeric input is ignored.
    pub fn set_quantity(&mut self, name: &str, quantity: f64) -> bool {
        if !quantity.is_finite() || quantity < 0.0 {
            return false;
        }
        match self.find_mut(name) {
            Some(item) => {
                item.quantity = quantity;
                true
            }
            None => false,
        }
    }

    /// Something is picked and every quantity is positive.
    pub fn is_valid(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|item| item.quantity > 0.0)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut SelectedMaterial> {
        self.items.iter_mut().find(|item| item.name == name)
    }
}

/// Stores a log dated now and its items in one batched insert.
pub async fn add_material_log(
    store: &dyn RecordStore,
    client_id: &str,
    items: &[SelectedMaterial],
    notes: Option<&str>,
) -> Result<(MaterialLog, Vec<MaterialItem>)> {
    if items.is_empty() {
        return Err(Error::validation("select at least one material"));
    }
    if let Some(bad) = items.iter().find(|item| !(item.quantity > 0.0)) {
        return Err(Error::validation(format!(
            "quantity for {} must be greater than zero",
            bad.name
        )));
    }

    let notes = notes
        .map(str::trim)
        .filter(|notes| !notes.is_empty())
        .map(str::to_string);
    let log: MaterialLog = insert_record(
        store,
        &NewMaterialLog {
            client_id: client_id.to_string(),
            date: None,
            notes,
        },
    )
    .await?;

    let rows = items
        .iter()
        .map(|item| {
            encode(&NewMaterialItem {
                log_id: log.id.clone(),
                name: item.name.clone(),
                quantity: item.quantity,
                unit: item.unit.clone(),
            })
        })
        .collect::<Result<Vec<Row>>>()?;
    let stored = store
        .insert_many(Collection::MaterialItems, rows)
        .await?
        .into_iter()
        .map(decode)
        .collect::<Result<Vec<MaterialItem>>>()?;

    info!(log_id = %log.id, client_id, items = stored.len(), "material log added");
    Ok((log, stored))
}

/// Deletes the log row; its items are left to the store.
pub async fn delete_material_log(store: &dyn RecordStore, log_id: &str) -> Result<()> {
    store.delete(Collection::MaterialLogs, log_id).await?;
    info!(log_id, "material log deleted");
    Ok(())
}

pub async fn update_material_log_date(
    store: &dyn RecordStore,
    log_id: &str,
    date: DateTime<Utc>,
) -> Result<()> {
    let mut patch = Row::new();
    patch.insert(
        "date".into(),
        Value::String(date.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    store.update(Collection::MaterialLogs, log_id, patch).await
}

pub async fn add_quick_select_material(
    store: &dyn RecordStore,
    name: &str,
    unit: &str,
) -> Result<QuickSelectMaterial> {
    let (name, unit) = (name.trim(), unit.trim());
    if name.is_empty() || unit.is_empty() {
        return Err(Error::validation("material name and unit are required"));
    }
    let material: QuickSelectMaterial = insert_record(
        store,
        &NewQuickSelectMaterial {
            name: name.to_string(),
            unit: unit.to_string(),
            is_default: false,
        },
    )
    .await?;
    info!(material = %material.name, "quick-select material added");
    Ok(material)
}

/// Removes a custom catalog entry; default entries are refused.
pub async fn remove_quick_select_material(
    store: &dyn RecordStore,
    material: &QuickSelectMaterial,
) -> Result<()> {
    if material.is_default {
        return Err(Error::validation(format!(
            "{} is a default material and cannot be removed",
            material.name
        )));
    }
    store
        .delete(Collection::QuickSelectMaterials, &material.id)
        .await
}
