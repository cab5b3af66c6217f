//! Client writes and single-client reads

use crate::error::{Error, Result};
use crate::models::{Client, NewClient};
use crate::store::{fetch, insert_record, Collection, Filter, Query, RecordStore};
use tracing::info;

/// Validates and trims form input into an insert payload.
///
/// Name and address are required; a missing contact is stored as an empty
/// string.
pub fn new_client(name: &str, address: &str, contact_name: &str) -> Result<NewClient> {
    let name = name.trim();
    let address = address.trim();
    let contact_name = contact_name.trim();

    if name.is_empty() {
        return Err(Error::validation("client name is required"));
    }
    if address.is_empty() {
        return Err(Error::validation("client address is required"));
    }

    Ok(NewClient {
        name: name.to_string(),
        address: address.to_string(),
        contact_name: contact_name.to_string(),
    })
}

pub async fn add_client(
    store: &dyn RecordStore,
    name: &str,
    address: &str,
    contact_name: &str,
) -> Result<Client> {
    let payload = new_client(name, address, contact_name)?;
    let client: Client = insert_record(store, &payload).await?;
    info!(client_id = %client.id, "client added");
    Ok(client)
}

/// Deletes the client row only; logs and items are left to the store.
pub async fn delete_client(store: &dyn RecordStore, id: &str) -> Result<()> {
    store.delete(Collection::Clients, id).await?;
    info!(client_id = id, "client deleted");
    Ok(())
}

pub async fn fetch_client(store: &dyn RecordStore, id: &str) -> Result<Option<Client>> {
    Ok(fetch(store, &Query::new().filter(Filter::eq("id", id)))
        .await?
        .into_iter()
        .next())
}
