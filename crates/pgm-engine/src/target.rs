//! Target connection health.
//!
//! A target handle carries a "usable" flag reported by the connection layer.
//! Before a pass, every handle is checked and unusable ones are replaced by
//! asking the [`Connector`] for a fresh handle. A failed reconnect is reported
//! for that scope only; the remaining targets are still refreshed.

use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use crate::error::Result;

/// Boxed future returned by [`Connector::connect`].
pub type ConnectFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A live handle to one monitored target.
pub trait Target: Send {
    /// Logical name of the target; used as its scope identifier.
    fn scope_name(&self) -> &str;

    /// Returns `true` while the handle can be used for queries.
    fn is_usable(&self) -> bool;
}

/// Opens handles to targets by logical name.
pub trait Connector<T>: Send + Sync {
    /// Opens a new handle for `scope_name`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Connection` if the target cannot be reached.
    fn connect<'a>(&'a self, scope_name: &'a str) -> ConnectFuture<'a, T>;
}

/// Keeps target handles usable by reconnecting closed ones.
#[derive(Debug)]
pub struct TargetHealth<C> {
    connector: C,
}

impl<C> TargetHealth<C> {
    /// Creates a health checker around `connector`.
    pub const fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Returns the wrapped connector.
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Makes sure `target` is usable, replacing it with a new handle if not.
    ///
    /// Returns `true` if a reconnect happened. A usable handle is returned
    /// untouched at no cost.
    ///
    /// # Errors
    ///
    /// Propagates the connector's error; `target` is left as it was.
    pub async fn ensure_usable<T>(&self, target: &mut T) -> Result<bool>
    where
        T: Target,
        C: Connector<T>,
    {
        if target.is_usable() {
            return Ok(false);
        }

        warn!(scope = target.scope_name(), "target handle is closed, reconnecting");
        let fresh = self.connector.connect(target.scope_name()).await?;
        info!(scope = fresh.scope_name(), "target reconnected");
        *target = fresh;
        Ok(true)
    }

    /// Runs [`TargetHealth::ensure_usable`] on every target.
    ///
    /// Failures are logged and returned; they never stop the other targets
    /// from being refreshed.
    pub async fn refresh_all<T>(&self, targets: &mut [T]) -> Vec<crate::EngineError>
    where
        T: Target,
        C: Connector<T>,
    {
        let mut failures = Vec::new();
        for target in targets.iter_mut() {
            if let Err(e) = self.ensure_usable(target).await {
                warn!(scope = target.scope_name(), error = %e, "reconnect failed");
                failures.push(e);
            }
        }
        failures
    }

    /// Opens the initial handle for every name, in order.
    ///
    /// # Errors
    ///
    /// Returns the first connection failure; at startup an unreachable target
    /// is fatal.
    pub async fn connect_all<T, S>(&self, names: &[S]) -> Result<Vec<T>>
    where
        T: Target,
        C: Connector<T>,
        S: AsRef<str> + Sync,
    {
        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            info!(scope = name, "opening target connection");
            targets.push(self.connector.connect(name).await?);
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Debug)]
    struct FakeTarget {
        name: String,
        usable: bool,
        generation: u32,
    }

    impl Target for FakeTarget {
        fn scope_name(&self) -> &str {
            &self.name
        }

        fn is_usable(&self) -> bool {
            self.usable
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        unreachable: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl Connector<FakeTarget> for FakeConnector {
        fn connect<'a>(&'a self, scope_name: &'a str) -> ConnectFuture<'a, FakeTarget> {
            Box::pin(async move {
                self.calls.lock().push(scope_name.to_string());
                if self.unreachable.contains(scope_name) {
                    return Err(EngineError::connection(scope_name, "connection refused"));
                }
                Ok(FakeTarget {
                    name: scope_name.to_string(),
                    usable: true,
                    generation: 1,
                })
            })
        }
    }

    fn closed(name: &str) -> FakeTarget {
        FakeTarget {
            name: name.to_string(),
            usable: false,
            generation: 0,
        }
    }

    #[tokio::test]
    async fn usable_handle_is_kept() {
        let health = TargetHealth::new(FakeConnector::default());
        let mut target = FakeTarget {
            name: "db1".into(),
            usable: true,
            generation: 0,
        };

        assert!(!health.ensure_usable(&mut target).await.expect("no reconnect needed"));
        assert_eq!(target.generation, 0);
        assert!(health.connector().calls.lock().is_empty());
    }

    #[tokio::test]
    async fn closed_handle_is_replaced() {
        let health = TargetHealth::new(FakeConnector::default());
        let mut target = closed("db1");

        assert!(health.ensure_usable(&mut target).await.expect("reconnect"));
        assert!(target.is_usable());
        assert_eq!(target.generation, 1);
    }

    #[tokio::test]
    async fn failed_reconnect_propagates_and_keeps_handle() {
        let connector = FakeConnector {
            unreachable: HashSet::from(["db1".to_string()]),
            ..Default::default()
        };
        let health = TargetHealth::new(connector);
        let mut target = closed("db1");

        let err = health.ensure_usable(&mut target).await.unwrap_err();
        assert!(matches!(err, EngineError::Connection { ref scope, .. } if scope == "db1"));
        assert!(!target.is_usable());
    }

    #[tokio::test]
    async fn refresh_all_isolates_failures() {
        let connector = FakeConnector {
            unreachable: HashSet::from(["db2".to_string()]),
            ..Default::default()
        };
        let health = TargetHealth::new(connector);
        let mut targets = vec![closed("db1"), closed("db2"), closed("db3")];

        let failures = health.refresh_all(&mut targets).await;

        assert_eq!(failures.len(), 1);
        assert!(targets[0].is_usable());
        assert!(!targets[1].is_usable());
        assert!(targets[2].is_usable());
        assert_eq!(*health.connector().calls.lock(), vec!["db1", "db2", "db3"]);
    }

    #[tokio::test]
    async fn connect_all_stops_on_first_failure() {
        let connector = FakeConnector {
            unreachable: HashSet::from(["db2".to_string()]),
            ..Default::default()
        };
        let health = TargetHealth::new(connector);

        let result: Result<Vec<FakeTarget>> = health.connect_all(&["db1", "db2", "db3"]).await;
        assert!(result.is_err());
        assert_eq!(*health.connector().calls.lock(), vec!["db1", "db2"]);
    }
}
