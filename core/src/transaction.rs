use crate::{Error, Result};
use driver::{Connection, DataSource, IsolationLevel};
use log::debug;
use std::sync::Arc;

/// Couples one connection to a commit/rollback/close lifecycle.
pub trait Transaction {
    fn connection(&mut self) -> Result<&mut dyn Connection>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    /// Transaction-scoped query timeout, in seconds.
    fn timeout(&self) -> Option<u64> {
        None
    }
}

/// Lazily obtains its connection from the datasource and drives
/// commit/rollback through the driver. Commit and rollback are no-ops while
/// the connection is in autocommit mode.
pub struct ManagedTransaction {
    data_source: Arc<dyn DataSource>,
    isolation: Option<IsolationLevel>,
    desired_auto_commit: bool,
    timeout: Option<u64>,
    connection: Option<Box<dyn Connection>>,
}

impl ManagedTransaction {
    pub fn new(
        data_source: Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        desired_auto_commit: bool,
    ) -> ManagedTransaction {
        ManagedTransaction {
            data_source,
            isolation,
            desired_auto_commit,
            timeout: None,
            connection: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<u64>) -> ManagedTransaction {
        self.timeout = timeout;
        self
    }

    fn open_connection(&mut self) -> Result<()> {
        debug!("opening driver connection");
        let mut connection = self.data_source.connection()?;
        if let Some(level) = self.isolation {
            connection
                .set_isolation(level)
                .map_err(Error::TransactionConfig)?;
        }
        let current = connection.auto_commit().map_err(Error::TransactionConfig)?;
        if current != self.desired_auto_commit {
            connection
                .set_auto_commit(self.desired_auto_commit)
                .map_err(Error::TransactionConfig)?;
        }
        self.connection = Some(connection);
        Ok(())
    }
}

impl Transaction for ManagedTransaction {
    fn connection(&mut self) -> Result<&mut dyn Connection> {
        if self.connection.is_none() {
            self.open_connection()?;
        }
        Ok(self.connection.as_mut().unwrap().as_mut())
    }

    fn commit(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.as_mut() {
            if !connection.auto_commit()? {
                debug!("committing driver connection");
                connection.commit()?;
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.as_mut() {
            if !connection.auto_commit()? {
                debug!("rolling back driver connection");
                connection.rollback()?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            // some drivers require autocommit before close, or they will
            // implicitly roll back pending work
            if !connection.auto_commit()? {
                connection.set_auto_commit(true)?;
            }
            debug!("closing driver connection");
            connection.close()?;
        }
        Ok(())
    }

    fn timeout(&self) -> Option<u64> {
        self.timeout
    }
}

/// Wraps a connection whose transaction lifecycle someone else drives;
/// commit, rollback and close do nothing.
pub struct ExternalTransaction {
    connection: Option<Box<dyn Connection>>,
}

impl ExternalTransaction {
    pub fn new(connection: Box<dyn Connection>) -> ExternalTransaction {
        ExternalTransaction {
            connection: Some(connection),
        }
    }
}

impl Transaction for ExternalTransaction {
    fn connection(&mut self) -> Result<&mut dyn Connection> {
        match self.connection.as_mut() {
            Some(c) => Ok(c.as_mut()),
            None => Err(Error::Driver(driver::Error::ConnectionClosed)),
        }
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // ownership stays with the caller; dropping the handle is enough to
        // return a pooled connection
        self.connection = None;
        Ok(())
    }
}

/// Chooses the transaction flavor for an environment, keyed by the
/// `transactionManager` type name in configuration markup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionFactory {
    Managed,
    External,
}

impl TransactionFactory {
    pub fn from_name(name: &str) -> Option<TransactionFactory> {
        Some(match name.to_uppercase().as_str() {
            "MANAGED" => TransactionFactory::Managed,
            "EXTERNAL" => TransactionFactory::External,
            _ => return None,
        })
    }

    pub fn new_transaction(
        &self,
        data_source: &Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        auto_commit: bool,
    ) -> Result<Box<dyn Transaction>> {
        match self {
            TransactionFactory::Managed => Ok(Box::new(ManagedTransaction::new(
                data_source.clone(),
                isolation,
                auto_commit,
            ))),
            TransactionFactory::External => {
                Ok(Box::new(ExternalTransaction::new(data_source.connection()?)))
            }
        }
    }
}

#[cfg(test)]
mod unit {
    use super::*;
    use crate::pool::UnpooledDataSource;
    use driver::testing;

    fn data_source(url: &str) -> (testing::Script, Arc<dyn DataSource>) {
        let script = testing::install(url);
        (script, Arc::new(UnpooledDataSource::new(url, "u", "p")))
    }

    #[test]
    fn managed_commit_is_noop_under_autocommit() {
        let (script, ds) = data_source("mem://tx-autocommit");
        let mut tx = ManagedTransaction::new(ds, None, true);
        tx.connection().unwrap();
        tx.commit().unwrap();
        assert_eq!(script.commits(), 0);
        tx.close().unwrap();
    }

    #[test]
    fn managed_commit_reaches_driver_without_autocommit() {
        let (script, ds) = data_source("mem://tx-managed");
        let mut tx = ManagedTransaction::new(ds, None, false);
        tx.connection().unwrap();
        tx.commit().unwrap();
        tx.rollback().unwrap();
        assert_eq!(script.commits(), 1);
        assert_eq!(script.rollbacks(), 1);
        tx.close().unwrap();
        assert_eq!(script.open_connections(), 0);
    }

    #[test]
    fn external_lifecycle_is_noop() {
        let (script, ds) = data_source("mem://tx-external");
        let conn = ds.connection().unwrap();
        let mut tx = ExternalTransaction::new(conn);
        tx.connection().unwrap();
        tx.commit().unwrap();
        tx.rollback().unwrap();
        assert_eq!(script.commits(), 0);
        assert_eq!(script.rollbacks(), 0);
        tx.close().unwrap();
    }

    #[test]
    fn lazy_connection_opens_on_first_use() {
        let (script, ds) = data_source("mem://tx-lazy");
        let mut tx = ManagedTransaction::new(ds, None, true);
        assert_eq!(script.total_connections(), 0);
        tx.connection().unwrap();
        assert_eq!(script.total_connections(), 1);
        tx.close().unwrap();
    }
}
