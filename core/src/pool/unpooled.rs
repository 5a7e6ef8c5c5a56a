use driver::{manager, Connection, DataSource, Result};
use std::collections::HashMap;

/// Opens a fresh driver connection per request through the driver manager.
/// The pooled datasource wraps this to reuse what it opens.
pub struct UnpooledDataSource {
    url: String,
    username: String,
    password: String,
    properties: HashMap<String, String>,
}

impl UnpooledDataSource {
    pub fn new(url: &str, username: &str, password: &str) -> UnpooledDataSource {
        UnpooledDataSource {
            url: url.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            properties: HashMap::new(),
        }
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> UnpooledDataSource {
        self.properties = properties;
        self
    }
}

impl DataSource for UnpooledDataSource {
    fn connection(&self) -> Result<Box<dyn Connection>> {
        let mut properties = self.properties.clone();
        properties.insert("user".to_string(), self.username.clone());
        properties.insert("password".to_string(), self.password.clone());
        manager::connect(&self.url, &properties)
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn password(&self) -> &str {
        &self.password
    }
}
