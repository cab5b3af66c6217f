//! Per-client statistics and log/item joins
//!
//! The list view makes three fetches (clients, logs, items) no matter how many
//! clients there are; the detail view makes at most three (client, logs, items
//! of those logs in one batch).

use crate::error::Result;
use crate::models::{Client, ClientWithStats, MaterialItem, MaterialLog, MaterialLogWithItems};
use crate::store::{fetch, Filter, Order, Query, RecordStore};
use std::collections::HashMap;
use tracing::debug;

const RECENT_MATERIALS: usize = 2;

/// Joins logs and items onto clients.
///
/// Logs are taken in the order given; the first log of each client counts as
/// its most recent one. Items whose log is unknown are ignored.
pub fn aggregate_clients(
    clients: &[Client],
    logs: &[MaterialLog],
    items: &[MaterialItem],
) -> Vec<ClientWithStats> {
    let mut logs_by_client: HashMap<&str, Vec<&str>> = HashMap::new();
    for log in logs {
        logs_by_client
            .entry(log.client_id.as_str())
            .or_default()
            .push(log.id.as_str());
    }

    let mut items_by_log: HashMap<&str, Vec<&str>> = HashMap::new();
    for item in items {
        items_by_log
            .entry(item.log_id.as_str())
            .or_default()
            .push(item.name.as_str());
    }

    clients
        .iter()
        .map(|client| {
            let log_ids = logs_by_client
                .get(client.id.as_str())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let total_items = log_ids
                .iter()
                .map(|id| items_by_log.get(id).map_or(0, Vec::len))
                .sum();
            let recent_materials = log_ids
                .first()
                .and_then(|id| items_by_log.get(id))
                .map(|names| {
                    names
                        .iter()
                        .take(RECENT_MATERIALS)
                        .map(|name| name.to_string())
                        .collect()
                })
                .unwrap_or_default();

            ClientWithStats {
                client: client.clone(),
                total_logs: log_ids.len(),
                total_items,
                recent_materials,
            }
        })
        .collect()
}

/// Attaches items to their logs, keeping log order and item order.
pub fn attach_items(logs: Vec<MaterialLog>, items: Vec<MaterialItem>) -> Vec<MaterialLogWithItems> {
    let mut items_by_log: HashMap<String, Vec<MaterialItem>> = HashMap::new();
    for item in items {
        items_by_log.entry(item.log_id.clone()).or_default().push(item);
    }

    logs.into_iter()
        .map(|log| {
            let material_items = items_by_log.remove(&log.id).unwrap_or_default();
            MaterialLogWithItems { log, material_items }
        })
        .collect()
}

/// Loads the client list with statistics.
///
/// Clients come newest first. Logs are requested newest first so that
/// `recent_materials` reflects the latest visit.
pub async fn load_client_list(store: &dyn RecordStore) -> Result<Vec<ClientWithStats>> {
    let clients: Vec<Client> =
        fetch(store, &Query::new().order(Order::desc("created_at"))).await?;
    let logs: Vec<MaterialLog> = fetch(store, &Query::new().order(Order::desc("date"))).await?;
    let items: Vec<MaterialItem> = fetch(store, &Query::new()).await?;

    debug!(
        clients = clients.len(),
        logs = logs.len(),
        items = items.len(),
        "aggregating client list"
    );
    Ok(aggregate_clients(&clients, &logs, &items))
}

/// A client with its logs, newest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientDetail {
    /// `None` when the client no longer exists
    pub client: Option<Client>,
    pub logs: Vec<MaterialLogWithItems>,
}

impl ClientDetail {
    pub fn total_items(&self) -> usize {
        self.logs.iter().map(|log| log.material_items.len()).sum()
    }
}

/// Loads the logs of one client ordered by date descending, with their items.
pub async fn load_client_logs(
    store: &dyn RecordStore,
    client_id: &str,
) -> Result<Vec<MaterialLogWithItems>> {
    let logs: Vec<MaterialLog> = fetch(
        store,
        &Query::new()
            .filter(Filter::eq("client_id", client_id))
            .order(Order::desc("date")),
    )
    .await?;

    if logs.is_empty() {
        return Ok(Vec::new());
    }

    let log_ids: Vec<String> = logs.iter().map(|log| log.id.clone()).collect();
    let items: Vec<MaterialItem> =
        fetch(store, &Query::new().filter(Filter::in_list("log_id", log_ids))).await?;
    Ok(attach_items(logs, items))
}

/// Loads the detail view of one client.
pub async fn load_client_detail(store: &dyn RecordStore, client_id: &str) -> Result<ClientDetail> {
    let client: Option<Client> = fetch(store, &Query::new().filter(Filter::eq("id", client_id)))
        .await?
        .into_iter()
        .next();
    let logs = load_client_logs(store, client_id).await?;
    debug!(client_id, logs = logs.len(), "loaded client detail");
    Ok(ClientDetail { client, logs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn client(id: &str) -> Client {
        Client {
            id: id.to_string(),
            name: format!("Client {}", id),
            address: "1 Elm St".to_string(),
            contact_name: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn log(id: &str, client_id: &str) -> MaterialLog {
        MaterialLog {
            id: id.to_string(),
            client_id: client_id.to_string(),
            date: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            notes: None,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        }
    }

    fn item(id: &str, log_id: &str, name: &str) -> MaterialItem {
        MaterialItem {
            id: id.to_string(),
            log_id: log_id.to_string(),
            name: name.to_string(),
            quantity: 1.0,
            unit: "yards".to_string(),
        }
    }

    #[test]
    fn counts_logs_and_items() {
        let clients = vec![client("a"), client("b")];
        let logs = vec![log("l1", "a"), log("l2", "a"), log("l3", "b")];
        let items = vec![
            item("i1", "l1", "Mulch"),
            item("i2", "l1", "Topsoil"),
            item("i3", "l1", "Edging"),
            item("i4", "l2", "Stone"),
            item("i5", "l3", "Sod"),
        ];

        let stats = aggregate_clients(&clients, &logs, &items);
        assert_eq!(stats[0].total_logs, 2);
        assert_eq!(stats[0].total_items, 4);
        assert_eq!(stats[0].recent_materials, vec!["Mulch", "Topsoil"]);
        assert_eq!(stats[1].total_logs, 1);
        assert_eq!(stats[1].recent_materials, vec!["Sod"]);

        let total: usize = stats.iter().map(|c| c.total_items).sum();
        assert_eq!(total, items.len());
    }

    #[test]
    fn zero_log_client() {
        let stats = aggregate_clients(&[client("a")], &[], &[item("i1", "orphan", "Mulch")]);
        assert_eq!(stats[0].total_logs, 0);
        assert_eq!(stats[0].total_items, 0);
        assert!(stats[0].recent_materials.is_empty());
    }

    #[test]
    fn recent_materials_follow_given_log_order() {
        let logs = vec![log("newer", "a"), log("older", "a")];
        let items = vec![item("i1", "older", "Old"), item("i2", "newer", "New")];
        let stats = aggregate_clients(&[client("a")], &logs, &items);
        assert_eq!(stats[0].recent_materials, vec!["New"]);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let clients = vec![client("a"), client("b")];
        let logs = vec![log("l1", "a")];
        let items = vec![item("i1", "l1", "Mulch")];
        assert_eq!(
            aggregate_clients(&clients, &logs, &items),
            aggregate_clients(&clients, &logs, &items)
        );
    }

    #[test]
    fn attach_items_keeps_order() {
        let logs = vec![log("l1", "a"), log("l2", "a")];
        let items = vec![
            item("i1", "l2", "Stone"),
            item("i2", "l1", "Mulch"),
            item("i3", "l2", "Sand"),
        ];
        let attached = attach_items(logs, items);
        assert_eq!(attached[0].material_items.len(), 1);
        let names: Vec<_> = attached[1].material_items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["Stone", "Sand"]);
    }
}
