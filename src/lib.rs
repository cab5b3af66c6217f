//! Bloom materials tracker data layer
//!
//! Clients, the material logs recorded against them, and the quick-select
//! catalog, kept in a hosted Postgres behind PostgREST and Realtime. Views are
//! mounted through [`Workspace`], which only exists while someone is signed in.

pub mod aggregate;
pub mod auth;
pub mod clients;
pub mod config;
pub mod error;
pub mod export;
pub mod geolocation;
pub mod import;
pub mod materials;
pub mod models;
pub mod store;
pub mod sync;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::aggregate::ClientDetail;
use crate::auth::{AuthProvider, AuthUser, SupabaseAuth};
use crate::config::{BloomConfig, BloomOptions};
use crate::error::{Error, Result};
use crate::export::ExportData;
use crate::import::{ImportReport, ParsedClient};
use crate::models::{Client, ClientWithStats, MaterialItem, MaterialLog, QuickSelectMaterial, SelectedMaterial};
use crate::store::{RecordStore, RemoteStore};
use crate::sync::{ClientDetailQuery, ClientListQuery, LiveQuery, LiveView, QuickSelectQuery, SignedIn};

/// Owns the store handle for the life of the application
pub struct Bloom {
    store: Arc<dyn RecordStore>,
    auth: Arc<dyn AuthProvider>,
    options: BloomOptions,
}

impl Bloom {
    pub fn new(store: Arc<dyn RecordStore>, auth: Arc<dyn AuthProvider>, options: BloomOptions) -> Self {
        Self { store, auth, options }
    }

    /// Opens the hosted store and its auth client.
    ///
    /// The returned [`SupabaseAuth`] is the same provider the facade consults,
    /// so signing in through it unlocks [`Bloom::workspace`].
    pub fn connect(config: &BloomConfig, options: BloomOptions) -> Result<(Self, Arc<SupabaseAuth>)> {
        let remote = Arc::new(RemoteStore::new(config, &options)?);

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let auth = Arc::new(SupabaseAuth::new(
            &config.base_url(),
            &config.anon_key,
            builder.build()?,
            remote.clone(),
        ));

        info!(url = %config.base_url(), schema = %options.db_schema, "connected");
        let bloom = Self::new(remote, auth.clone(), options);
        Ok((bloom, auth))
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn options(&self) -> &BloomOptions {
        &self.options
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.auth.current_user()
    }

    /// Data access for the signed-in user; `None` when nobody is signed in.
    pub fn workspace(&self) -> Option<Workspace<'_>> {
        let user = self.auth.current_user()?;
        Some(Workspace { bloom: self, user })
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.auth.sign_out().await
    }

    /// Closes the store, releasing any subscriptions it still holds.
    pub async fn shutdown(self) -> Result<()> {
        self.store.close().await?;
        info!("store closed");
        Ok(())
    }
}

/// Everything a signed-in user can read and change
///
/// Every call checks the session again; after sign-out they fail with
/// [`Error::Auth`] and mounted views drop their data on the next refetch.
pub struct Workspace<'a> {
    bloom: &'a Bloom,
    user: AuthUser,
}

impl<'a> Workspace<'a> {
    pub fn user(&self) -> &AuthUser {
        &self.user
    }

    /// Fails once this workspace's user is no longer the one signed in.
    fn ensure_signed_in(&self) -> Result<()> {
        match self.bloom.auth.current_user() {
            Some(user) if user.id == self.user.id => Ok(()),
            _ => Err(Error::auth("signed out")),
        }
    }

    fn store(&self) -> Result<&dyn RecordStore> {
        self.ensure_signed_in()?;
        Ok(self.bloom.store.as_ref())
    }

    async fn mount<Q: LiveQuery>(&self, query: Q) -> Result<LiveView<Q::Output>> {
        self.ensure_signed_in()?;
        let query = SignedIn::new(query, self.bloom.auth.clone(), &self.user.id);
        LiveView::mount(self.bloom.store.clone(), query, &self.bloom.options).await
    }

    pub async fn mount_client_list(&self) -> Result<LiveView<Vec<ClientWithStats>>> {
        self.mount(ClientListQuery).await
    }

    pub async fn mount_client_detail(&self, client_id: &str) -> Result<LiveView<ClientDetail>> {
        self.mount(ClientDetailQuery::new(client_id)).await
    }

    pub async fn mount_quick_select(&self) -> Result<LiveView<Vec<QuickSelectMaterial>>> {
        self.mount(QuickSelectQuery).await
    }

    pub async fn client_list(&self) -> Result<Vec<ClientWithStats>> {
        aggregate::load_client_list(self.store()?).await
    }

    pub async fn client_detail(&self, client_id: &str) -> Result<ClientDetail> {
        aggregate::load_client_detail(self.store()?, client_id).await
    }

    pub async fn client(&self, id: &str) -> Result<Option<Client>> {
        clients::fetch_client(self.store()?, id).await
    }

    pub async fn add_client(&self, name: &str, address: &str, contact_name: &str) -> Result<Client> {
        clients::add_client(self.store()?, name, address, contact_name).await
    }

    pub async fn delete_client(&self, id: &str) -> Result<()> {
        clients::delete_client(self.store()?, id).await
    }

    pub async fn add_material_log(
        &self,
        client_id: &str,
        items: &[SelectedMaterial],
        notes: Option<&str>,
    ) -> Result<(MaterialLog, Vec<MaterialItem>)> {
        materials::add_material_log(self.store()?, client_id, items, notes).await
    }

    pub async fn delete_material_log(&self, log_id: &str) -> Result<()> {
        materials::delete_material_log(self.store()?, log_id).await
    }

    pub async fn update_material_log_date(&self, log_id: &str, date: DateTime<Utc>) -> Result<()> {
        materials::update_material_log_date(self.store()?, log_id, date).await
    }

    pub async fn quick_select_materials(&self) -> Result<Vec<QuickSelectMaterial>> {
        store::fetch(
            self.store()?,
            &store::Query::new().order(store::Order::asc("name")),
        )
        .await
    }

    pub async fn add_quick_select_material(&self, name: &str, unit: &str) -> Result<QuickSelectMaterial> {
        materials::add_quick_select_material(self.store()?, name, unit).await
    }

    pub async fn remove_quick_select_material(&self, material: &QuickSelectMaterial) -> Result<()> {
        materials::remove_quick_select_material(self.store()?, material).await
    }

    /// Parses delimited text and inserts every named row.
    ///
    /// A file that cannot be mapped is an error; individual rows that fail to
    /// insert are counted in the report.
    pub async fn import_csv<R: Read>(&self, reader: R) -> Result<ImportReport> {
        let parsed = import::parse_csv(reader)?;
        self.import_clients(&parsed).await
    }

    pub async fn import_clients(&self, clients: &[ParsedClient]) -> Result<ImportReport> {
        Ok(import::import_clients(self.store()?, clients).await)
    }

    pub async fn export_data(&self) -> Result<ExportData> {
        ExportData::load(self.store()?).await
    }

    /// Writes `<product>_export_<YYYYMMDD>.csv` into `dir`.
    pub async fn write_export(&self, dir: &Path) -> Result<PathBuf> {
        export::write_export(self.store()?, dir, &self.bloom.options.product_name).await
    }
}

/// Common imports
pub mod prelude {
    pub use crate::auth::{AuthProvider, AuthUser};
    pub use crate::config::{BloomConfig, BloomOptions};
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::store::{Collection, Filter, MemoryStore, Order, Query, RecordStore};
    pub use crate::sync::{LiveView, Snapshot};
    pub use crate::{Bloom, Workspace};
}
