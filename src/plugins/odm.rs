//! Document store plugin.
//!
//! Documents are serde values stored as json, grouped into collections inside
//! a named database. The store lives in a SQLite file, or in memory with the
//! default `uri`. The connection opens on startup and closes on shutdown;
//! handlers resolve an [`OdmDatabase`] from the injector while it is open.

use std::{marker::PhantomData, sync::Arc};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    configs::{build_config_from_file_in_package, ConfigError, Package, APPLICATION_CONFIG_FILENAME},
    dependency_injection::{Binder, Module},
    plugin::{ApplicationView, Plugin},
};

pub const ODM_PLUGIN_NAME: &str = "odm";
pub const ODM_CONFIG_KEY: &str = "odm";

/// `uri` keeping the store in memory.
pub const IN_MEMORY_URI: &str = ":memory:";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    database TEXT NOT NULL,
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (database, collection, id)
);
";

/// The `odm` section of `application.yaml`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OdmConfig {
    /// Path of the SQLite file, or [`IN_MEMORY_URI`].
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_uri() -> String {
    IN_MEMORY_URI.into()
}

fn default_database() -> String {
    "test".into()
}

impl Default for OdmConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            database: default_database(),
        }
    }
}

impl OdmConfig {
    pub fn from_package(package: &Package) -> Result<Self, ConfigError> {
        build_config_from_file_in_package(package, APPLICATION_CONFIG_FILENAME, ODM_CONFIG_KEY)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OdmError {
    #[error("the document store is not connected")]
    NotConnected,
    #[error("document `{id}` not found in `{collection}`")]
    NotFound { collection: String, id: String },
    #[error("document `{id}` already exists in `{collection}`")]
    AlreadyExists { collection: String, id: String },
    #[error("document store: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("invalid document: {0}")]
    Document(#[from] serde_json::Error),
}

/// Connection to the document store.
#[derive(Default)]
pub struct OdmClient {
    connection: Mutex<Option<Connection>>,
}

impl OdmClient {
    /// Opens the store, replacing a previous connection.
    pub fn connect(&self, uri: &str) -> Result<(), OdmError> {
        let connection = if uri == IN_MEMORY_URI {
            Connection::open_in_memory()?
        } else {
            Connection::open(uri)?
        };
        connection.execute_batch(SCHEMA)?;
        *self.connection.lock() = Some(connection);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    /// Closing a client that is not connected does nothing.
    pub fn close(&self) -> Result<(), OdmError> {
        let connection = self.connection.lock().take();
        match connection {
            Some(connection) => connection.close().map_err(|(_, e)| e.into()),
            None => Ok(()),
        }
    }

    pub fn database(self: &Arc<Self>, name: &str) -> Result<OdmDatabase, OdmError> {
        if !self.is_connected() {
            return Err(OdmError::NotConnected);
        }
        Ok(OdmDatabase {
            client: self.clone(),
            name: name.into(),
        })
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, OdmError>,
    ) -> Result<T, OdmError> {
        let guard = self.connection.lock();
        let connection = guard.as_ref().ok_or(OdmError::NotConnected)?;
        f(connection)
    }
}

/// A named database of the store.
#[derive(Clone)]
pub struct OdmDatabase {
    client: Arc<OdmClient>,
    name: String,
}

impl OdmDatabase {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection<D>(&self, name: &str) -> Collection<D> {
        Collection {
            database: self.clone(),
            name: name.into(),
            document: PhantomData,
        }
    }
}

/// Documents of type `D`, keyed by id.
pub struct Collection<D> {
    database: OdmDatabase,
    name: String,
    document: PhantomData<fn() -> D>,
}

impl<D> Clone for Collection<D> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            name: self.name.clone(),
            document: PhantomData,
        }
    }
}

impl<D: Serialize + DeserializeOwned> Collection<D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&self, id: &str, document: &D) -> Result<(), OdmError> {
        let body = serde_json::to_string(document)?;
        self.database.client.with_connection(|connection| {
            let inserted = connection.execute(
                "INSERT INTO documents (database, collection, id, body) VALUES (?1, ?2, ?3, ?4)",
                params![self.database.name, self.name, id, body],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(ref e) if is_unique_constraint_error(e) => Err(OdmError::AlreadyExists {
                    collection: self.name.clone(),
                    id: id.into(),
                }),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn find(&self, id: &str) -> Result<Option<D>, OdmError> {
        let body = self.database.client.with_connection(|connection| {
            Ok(connection
                .query_row(
                    "SELECT body FROM documents WHERE database = ?1 AND collection = ?2 AND id = ?3",
                    params![self.database.name, self.name, id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })?;
        body.map(|body| serde_json::from_str(&body))
            .transpose()
            .map_err(Into::into)
    }

    pub fn get(&self, id: &str) -> Result<D, OdmError> {
        self.find(id)?.ok_or_else(|| self.not_found(id))
    }

    pub fn replace(&self, id: &str, document: &D) -> Result<(), OdmError> {
        let body = serde_json::to_string(document)?;
        let updated = self.database.client.with_connection(|connection| {
            Ok(connection.execute(
                "UPDATE documents SET body = ?4 WHERE database = ?1 AND collection = ?2 AND id = ?3",
                params![self.database.name, self.name, id, body],
            )?)
        })?;
        match updated {
            0 => Err(self.not_found(id)),
            _ => Ok(()),
        }
    }

    pub fn delete(&self, id: &str) -> Result<(), OdmError> {
        let deleted = self.database.client.with_connection(|connection| {
            Ok(connection.execute(
                "DELETE FROM documents WHERE database = ?1 AND collection = ?2 AND id = ?3",
                params![self.database.name, self.name, id],
            )?)
        })?;
        match deleted {
            0 => Err(self.not_found(id)),
            _ => Ok(()),
        }
    }

    /// Every document with its id, ordered by id.
    pub fn list(&self) -> Result<Vec<(String, D)>, OdmError> {
        let rows = self.database.client.with_connection(|connection| {
            let mut stmt = connection.prepare(
                "SELECT id, body FROM documents WHERE database = ?1 AND collection = ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![self.database.name, self.name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        rows.into_iter()
            .map(|(id, body)| -> Result<(String, D), OdmError> {
                Ok((id, serde_json::from_str(&body)?))
            })
            .collect()
    }

    fn not_found(&self, id: &str) -> OdmError {
        OdmError::NotFound {
            collection: self.name.clone(),
            id: id.into(),
        }
    }
}

fn is_unique_constraint_error(err: &rusqlite::Error) -> bool {
    err.to_string().contains("UNIQUE constraint failed")
}

struct OdmModule;

impl Module for OdmModule {
    fn configure(&self, binder: &mut Binder) {
        binder
            .bind_singleton::<Arc<OdmConfig>, _>(|injector| {
                let application: Arc<dyn ApplicationView> = injector.get()?;
                Ok(Arc::new(OdmConfig::from_package(application.package())?))
            })
            .bind_singleton::<Arc<OdmClient>, _>(|_| Ok(Arc::new(OdmClient::default())))
            .bind_provider::<OdmDatabase, _>(|injector| {
                let config: Arc<OdmConfig> = injector.get()?;
                let client: Arc<OdmClient> = injector.get()?;
                Ok(client.database(&config.database)?)
            });
    }
}

/// Opens the document store while the application serves requests.
#[derive(Clone, Copy, Debug, Default)]
pub struct OdmPlugin;

#[async_trait]
impl Plugin for OdmPlugin {
    fn name(&self) -> &str {
        ODM_PLUGIN_NAME
    }

    fn module(&self) -> Option<Arc<dyn Module>> {
        Some(Arc::new(OdmModule))
    }

    fn pre_conditions_check(&self, application: &dyn ApplicationView) -> bool {
        match OdmConfig::from_package(application.package()) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Invalid odm configuration: {e}");
                false
            }
        }
    }

    fn on_load(&self, _application: &dyn ApplicationView) -> anyhow::Result<()> {
        tracing::debug!("ODM plugin loaded.");
        Ok(())
    }

    async fn on_startup(&self, application: &dyn ApplicationView) -> anyhow::Result<()> {
        let injector = application
            .injector()
            .ok_or_else(|| anyhow!("the odm plugin needs an injector"))?;
        let config: Arc<OdmConfig> = injector.get()?;
        let client: Arc<OdmClient> = injector.get()?;
        let uri = config.uri.clone();
        tokio::task::spawn_blocking(move || client.connect(&uri))
            .await
            .context("opening the document store panicked")?
            .with_context(|| format!("opening the document store at `{}`", config.uri))?;
        tracing::debug!("ODM plugin started on database `{}`.", config.database);
        Ok(())
    }

    async fn on_shutdown(&self, application: &dyn ApplicationView) -> anyhow::Result<()> {
        let injector = application
            .injector()
            .ok_or_else(|| anyhow!("the odm plugin needs an injector"))?;
        let client: Arc<OdmClient> = injector.get()?;
        client.close()?;
        tracing::debug!("ODM plugin shutdown.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
    struct Book {
        title: String,
        year: u16,
    }

    fn book(title: &str, year: u16) -> Book {
        Book {
            title: title.into(),
            year,
        }
    }

    fn connected() -> Arc<OdmClient> {
        let client = Arc::new(OdmClient::default());
        client.connect(IN_MEMORY_URI).unwrap();
        client
    }

    #[test]
    fn config_defaults_and_strictness() {
        let config: OdmConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, OdmConfig::default());
        assert_eq!(config.uri, ":memory:");
        assert_eq!(config.database, "test");
        assert!(serde_yaml::from_str::<OdmConfig>("mongo_uri: x").is_err());
    }

    #[test]
    fn documents_round_trip_through_a_collection() {
        let books = connected().database("library").unwrap().collection::<Book>("books");
        books.insert("b2", &book("Dune", 1965)).unwrap();
        books.insert("b1", &book("Emma", 1815)).unwrap();
        assert_eq!(books.get("b2").unwrap(), book("Dune", 1965));

        books.replace("b2", &book("Dune", 1966)).unwrap();
        assert_eq!(
            books.list().unwrap(),
            vec![
                ("b1".to_string(), book("Emma", 1815)),
                ("b2".to_string(), book("Dune", 1966))
            ]
        );

        books.delete("b1").unwrap();
        assert!(books.find("b1").unwrap().is_none());
        assert!(matches!(books.get("b1"), Err(OdmError::NotFound { .. })));
        assert!(matches!(books.delete("b1"), Err(OdmError::NotFound { .. })));
        assert!(matches!(
            books.replace("b1", &book("Emma", 1815)),
            Err(OdmError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let books = connected().database("library").unwrap().collection::<Book>("books");
        books.insert("b1", &book("Emma", 1815)).unwrap();
        assert!(matches!(
            books.insert("b1", &book("Dune", 1965)),
            Err(OdmError::AlreadyExists { ref id, .. }) if id == "b1"
        ));
    }

    #[test]
    fn databases_and_collections_are_separate() {
        let client = connected();
        let library = client.database("library").unwrap();
        let archive = client.database("archive").unwrap();
        library
            .collection::<Book>("books")
            .insert("b1", &book("Emma", 1815))
            .unwrap();
        assert!(archive.collection::<Book>("books").list().unwrap().is_empty());
        assert!(library.collection::<Book>("loans").list().unwrap().is_empty());
    }

    #[test]
    fn closed_client_refuses_access() {
        let client = Arc::new(OdmClient::default());
        assert!(matches!(client.database("x"), Err(OdmError::NotConnected)));

        client.connect(IN_MEMORY_URI).unwrap();
        let books = client.database("library").unwrap().collection::<Book>("books");
        client.close().unwrap();
        assert!(!client.is_connected());
        assert!(matches!(books.list(), Err(OdmError::NotConnected)));
        client.close().unwrap();
    }

    #[test]
    fn file_store_survives_reconnection() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("store.db").to_string_lossy().into_owned();
        let client = Arc::new(OdmClient::default());
        client.connect(&uri).unwrap();
        client
            .database("library")
            .unwrap()
            .collection::<Book>("books")
            .insert("b1", &book("Emma", 1815))
            .unwrap();
        client.close().unwrap();

        client.connect(&uri).unwrap();
        let books = client.database("library").unwrap().collection::<Book>("books");
        assert_eq!(books.get("b1").unwrap(), book("Emma", 1815));
    }
}
