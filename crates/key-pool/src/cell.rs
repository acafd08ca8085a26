//! One pool per configuration, owned by the composition root
//!
//! The service keeps a single `PoolCell` and every component asks it for the
//! pool. The first `get_or_init` builds the pool; later calls get the same
//! instance back and their key list is ignored.

use std::sync::{Arc, OnceLock};

use common::ApiKey;
use tracing::debug;

use crate::pool::{KeyPool, PoolConfig};

#[derive(Default)]
pub struct PoolCell {
    pool: OnceLock<Arc<KeyPool>>,
}

impl PoolCell {
    pub const fn new() -> Self {
        Self {
            pool: OnceLock::new(),
        }
    }

    /// Return the pool, creating it from `keys` and `config` on first use.
    ///
    /// Must be called from within a tokio runtime (construction spawns the
    /// decay task).
    pub fn get_or_init<I, K>(&self, keys: I, config: PoolConfig) -> Arc<KeyPool>
    where
        I: IntoIterator<Item = K>,
        K: Into<ApiKey>,
    {
        let mut created = false;
        let pool = self.pool.get_or_init(|| {
            created = true;
            KeyPool::new(keys, config)
        });
        if !created {
            debug!("key pool already initialized, supplied keys ignored");
        }
        pool.clone()
    }

    /// The pool, if it has been created.
    pub fn get(&self) -> Option<Arc<KeyPool>> {
        self.pool.get().cloned()
    }
}
