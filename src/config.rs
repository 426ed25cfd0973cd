use std::path::{Path, PathBuf};

use chrono::Duration;
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::{
    model::mongodb::ensure_indexes_exist,
    signing::{pki::RpcClient, remote::RemoteClient},
};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Deserialize)]
pub struct Config {
    // non-secrets
    files_dir: PathBuf,
    session_ttl: u32,
    auth_ttl: u32,
    pki_service_url: String,
    pki_service_name: String,
    remote_service_url: String,
    remote_rp_name: String,
    // secrets
    jwt_secret: String,
    hmac_secret: String,
    remote_rp_uuid: String,
    remote_access_token: String,
}

impl Config {
    /// Root directory of the on-disk archive cache
    /// (`files/{topic}/{vote}/...`).
    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// Valid lifetime of a signing-session handle in seconds.
    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl.into())
    }

    /// Valid lifetime of voter auth cookies in seconds.
    pub fn auth_ttl(&self) -> Duration {
        Duration::seconds(self.auth_ttl.into())
    }

    /// Secret key used to sign session and auth JWTs.
    pub fn jwt_secret(&self) -> &[u8] {
        self.jwt_secret.as_bytes()
    }

    /// Secret key used to pseudonymise national IDs.
    pub fn hmac_secret(&self) -> &[u8] {
        self.hmac_secret.as_bytes()
    }

    /// Endpoint of the PKI/phone signing gateway.
    pub fn pki_service_url(&self) -> &str {
        &self.pki_service_url
    }

    /// Service name we identify ourselves with on the PKI gateway.
    pub fn pki_service_name(&self) -> &str {
        &self.pki_service_name
    }

    /// Base URL of the remote-challenge signing service.
    pub fn remote_service_url(&self) -> &str {
        &self.remote_service_url
    }

    /// Relying-party name sent to the remote-challenge service.
    pub fn remote_rp_name(&self) -> &str {
        &self.remote_rp_name
    }

    /// Relying-party UUID sent to the remote-challenge service.
    pub fn remote_rp_uuid(&self) -> &str {
        &self.remote_rp_uuid
    }

    /// Bearer token for the remote-challenge service.
    pub fn remote_access_token(&self) -> &str {
        &self.remote_access_token
    }
}

/// A fairing that loads the application config and puts it in managed state.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
}

/// A fairing that loads the MongoDB config, connects to the database,
/// ensures the required indexes exist, and places both a `Client` and a
/// `Database` into managed state.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!("Loaded database config, connecting...");
        let client = match MongoClient::with_uri_str(config.db_uri).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };
        let db = client.database(&get_database_name());

        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to connect to database: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        rocket = rocket.manage(client).manage(db);
        Ok(rocket)
    }
}

/// Get the name of the database to use (production version).
#[cfg(not(test))]
fn get_database_name() -> String {
    "agora".to_string()
}

/// Get the name of the database to use (test version).
/// Use a random name to avoid collisions between tests.
#[cfg(test)]
fn get_database_name() -> String {
    let random: u32 = rand::random();
    let db = format!("test{random}");
    info!("Using database {db}");
    db
}

/// A fairing that constructs the external signing-service clients from the
/// application config and places them into managed state. Must be attached
/// after `ConfigFairing`.
pub struct SigningServicesFairing;

#[rocket::async_trait]
impl Fairing for SigningServicesFairing {
    fn info(&self) -> Info {
        Info {
            name: "Signing services",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.state::<Config>() {
            Some(config) => config,
            None => {
                error!("Config was not available when building signing clients");
                return Err(rocket);
            }
        };

        let http = reqwest::Client::new();
        let pki = RpcClient::new(
            http.clone(),
            config.pki_service_url().to_string(),
            config.pki_service_name().to_string(),
        );
        let remote = RemoteClient::new(
            http,
            config.remote_service_url().to_string(),
            config.remote_rp_uuid().to_string(),
            config.remote_rp_name().to_string(),
            config.remote_access_token().to_string(),
        );
        info!("Constructed signing service clients");

        rocket = rocket.manage(pki).manage(remote);
        Ok(rocket)
    }
}
