//! Environmental management
//!
//! This module holds the process-wide configuration of the matching engine and the `Universe`, a
//! set of endpoints connected through an in-process `MemFabric`.
//!
//! No environment variables or files are read. A program that wants something other than the
//! defaults either installs a global `Config` once, before any endpoint is built, or hands a
//! `Config` to each `EndpointBuilder`.

use once_cell::sync::OnceCell;

use crate::datatype::Format;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::transport::mem::MemFabric;
use crate::Rank;

static GLOBAL: OnceCell<Config> = OnceCell::new();

/// Configuration of an endpoint's queues.
///
/// # Examples
///
/// ```
/// use mpi_match::environment::Config;
///
/// let config = Config::default()
///     .with_element_slab_initial(16)
///     .with_debug_queues(true);
/// assert_eq!(config.element_slab_growth, 100);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of queue elements allocated up front
    pub element_slab_initial: usize,
    /// Number of queue elements added whenever the free list runs dry
    pub element_slab_growth: usize,
    /// Upper bound on queue elements; running into it fails with `Error::Exhausted`
    pub element_slab_limit: Option<usize>,
    /// Log every queue element from `Endpoint::dump_queues()`
    pub debug_queues: bool,
    /// Keep a list of active sends for `Endpoint::inspect_sends()`
    pub keep_send_q: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            element_slab_initial: 100,
            element_slab_growth: 100,
            element_slab_limit: None,
            debug_queues: false,
            keep_send_q: false,
        }
    }
}

impl Config {
    /// Set `element_slab_initial`.
    pub fn with_element_slab_initial(mut self, elements: usize) -> Self {
        self.element_slab_initial = elements;
        self
    }

    /// Set `element_slab_growth`.
    pub fn with_element_slab_growth(mut self, elements: usize) -> Self {
        self.element_slab_growth = elements;
        self
    }

    /// Set `element_slab_limit`.
    pub fn with_element_slab_limit(mut self, limit: Option<usize>) -> Self {
        self.element_slab_limit = limit;
        self
    }

    /// Set `debug_queues`.
    pub fn with_debug_queues(mut self, enabled: bool) -> Self {
        self.debug_queues = enabled;
        self
    }

    /// Set `keep_send_q`.
    pub fn with_keep_send_q(mut self, enabled: bool) -> Self {
        self.keep_send_q = enabled;
        self
    }

    /// Make this the configuration of every endpoint built without an explicit one.
    ///
    /// Only the first call has an effect; later calls hand their `Config` back.
    pub fn install(self) -> std::result::Result<(), Config> {
        GLOBAL.set(self)
    }

    /// The installed configuration, or the default if none was installed.
    pub fn global() -> Config {
        GLOBAL.get().cloned().unwrap_or_default()
    }
}

/// A set of endpoints connected through one in-process fabric
///
/// # Examples
///
/// ```
/// use mpi_match::environment::Universe;
///
/// let universe = Universe::new(3).unwrap();
/// assert_eq!(universe.size(), 3);
/// assert_eq!(universe.endpoint(2).unwrap().rank(), 2);
/// assert!(universe.endpoint(3).is_err());
/// ```
pub struct Universe {
    fabric: MemFabric,
    endpoints: Vec<Endpoint>,
}

impl Universe {
    /// `size` endpoints, all using the native data format.
    pub fn new(size: usize) -> Result<Universe> {
        Universe::with_formats(&vec![Format::native(); size])
    }

    /// One endpoint per entry of `formats`, each packing its data in that format.
    pub fn with_formats(formats: &[Format]) -> Result<Universe> {
        Universe::with_fabric(MemFabric::new(formats), Config::global())
    }

    /// One endpoint per rank of `fabric`, all configured with `config`.
    pub fn with_fabric(fabric: MemFabric, config: Config) -> Result<Universe> {
        if fabric.size() == 0 {
            return Err(Error::Count("a universe needs at least one endpoint"));
        }
        let mut endpoints = Vec::with_capacity(fabric.size());
        for rank in 0..fabric.size() {
            let rank = Rank::try_from(rank).map_err(|_| Error::Count("too many endpoints"))?;
            let endpoint = Endpoint::builder(rank)
                .format(fabric.format(rank).unwrap_or_default())
                .config(config.clone())
                .transport(fabric.transport(rank)?)
                .build()?;
            endpoints.push(endpoint);
        }
        Ok(Universe { fabric, endpoints })
    }

    /// Number of endpoints
    pub fn size(&self) -> usize {
        self.endpoints.len()
    }

    /// The endpoint at `rank`.
    pub fn endpoint(&self, rank: Rank) -> Result<Endpoint> {
        usize::try_from(rank)
            .ok()
            .and_then(|r| self.endpoints.get(r))
            .cloned()
            .ok_or(Error::Rank(rank))
    }

    /// The fabric connecting the endpoints
    pub fn fabric(&self) -> &MemFabric {
        &self.fabric
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.element_slab_initial, 100);
        assert_eq!(config.element_slab_growth, 100);
        assert_eq!(config.element_slab_limit, None);
        assert!(!config.debug_queues);
        assert!(!config.keep_send_q);
    }

    #[test]
    fn heterogeneous_universe() {
        let universe = Universe::with_formats(&[Format::Big, Format::Little]).unwrap();
        assert_eq!(universe.endpoint(0).unwrap().format(), Format::Big);
        assert_eq!(universe.endpoint(1).unwrap().format(), Format::Little);
        assert_eq!(universe.endpoint(-1).unwrap_err(), Error::Rank(-1));
        assert!(Universe::new(0).is_err());
    }
}
