//! Typed records for the four collections plus the derived view types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A landscaping client (customer or job site)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One visit's worth of materials for a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialLog {
    pub id: String,
    pub client_id: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A line item within a material log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialItem {
    pub id: String,
    pub log_id: String,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
}

/// Catalog entry offered when logging materials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickSelectMaterial {
    pub id: String,
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for [`Client`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewClient {
    pub name: String,
    pub address: String,
    /// Empty when no contact was given
    pub contact_name: String,
}

/// Insert payload for [`MaterialLog`]; the store fills `date` when absent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMaterialLog {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Insert payload for [`MaterialItem`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMaterialItem {
    pub log_id: String,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
}

/// Insert payload for [`QuickSelectMaterial`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewQuickSelectMaterial {
    pub name: String,
    pub unit: String,
    pub is_default: bool,
}

/// A client with statistics derived from its logs and items
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientWithStats {
    #[serde(flatten)]
    pub client: Client,
    pub total_logs: usize,
    pub total_items: usize,
    /// Up to two item names from the most recent log
    pub recent_materials: Vec<String>,
}

/// A log with its items in store insertion order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterialLogWithItems {
    #[serde(flatten)]
    pub log: MaterialLog,
    pub material_items: Vec<MaterialItem>,
}

/// A material picked in the log form, before it is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedMaterial {
    pub name: String,
    pub quantity: f64,
    pub unit: String,
}

impl SelectedMaterial {
    pub fn new(name: &str, quantity: f64, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            quantity,
            unit: unit.to_string(),
        }
    }
}
