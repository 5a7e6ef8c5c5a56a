//! A process-wide registry of connectors, looked up by url at connect time.

use crate::{Connection, Driver, Error, Result};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

lazy_static! {
    static ref DRIVERS: Mutex<Vec<Arc<dyn Driver>>> = Mutex::new(Vec::new());
}

/// Register a connector. Registration is idempotent per driver instance;
/// callers typically register once at startup.
pub fn register_driver(driver: Arc<dyn Driver>) {
    let mut drivers = DRIVERS.lock().unwrap();
    if !drivers.iter().any(|d| Arc::ptr_eq(d, &driver)) {
        drivers.push(driver);
    }
}

/// Open a connection through the first registered driver accepting the url.
pub fn connect(url: &str, properties: &HashMap<String, String>) -> Result<Box<dyn Connection>> {
    let driver = {
        let drivers = DRIVERS.lock().unwrap();
        drivers.iter().find(|d| d.accepts(url)).cloned()
    };
    match driver {
        Some(driver) => driver.connect(url, properties),
        None => Err(Error::NoSuitableDriver(url.to_string())),
    }
}
