#[macro_use]
extern crate rocket;

#[macro_use]
extern crate log;

pub mod api;
pub mod archive;
pub mod certificate;
pub mod config;
pub mod container;
pub mod error;
pub mod logging;
pub mod model;
pub mod signing;

pub use config::Config;

use config::{ConfigFairing, DatabaseFairing, SigningServicesFairing};
use logging::LoggerFairing;
use rocket::{Build, Rocket};

/// Assemble the server: configuration, database, signing-service clients,
/// request logging, and the route set.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(ConfigFairing)
        .attach(DatabaseFairing)
        .attach(SigningServicesFairing)
        .attach(LoggerFairing)
}
