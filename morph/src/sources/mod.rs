//! Migration sources.
//!
//! A source supplies the full catalog of available migrations, both `up` and
//! `down` entries. Sources only discover scripts and parse filenames; the
//! engine never assumes an ordering from them and sorts on its own.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::error::Error;
use crate::models::Migration;

mod embedded;
mod file;

pub use embedded::EmbeddedSource;
pub use file::FileSource;

pub trait Source: Send {
    /// The full catalog of known migrations, in no particular order.
    fn migrations(&self) -> Vec<Migration>;
}

/// A source over a prebuilt list of migrations.
pub struct MemorySource {
    migrations: Vec<Migration>,
}

impl MemorySource {
    pub fn new(migrations: Vec<Migration>) -> MemorySource {
        MemorySource { migrations }
    }
}

impl Source for MemorySource {
    fn migrations(&self) -> Vec<Migration> {
        self.migrations.clone()
    }
}

pub type SourceFactory = fn(&str) -> Result<Box<dyn Source>, Error>;

static SOURCES: Lazy<RwLock<HashMap<&'static str, SourceFactory>>> = Lazy::new(|| {
    let mut registered: HashMap<&'static str, SourceFactory> = HashMap::new();
    registered.insert("file", |url| {
        let path = url.strip_prefix("file://").unwrap_or(url);
        Ok(Box::new(FileSource::open(path)?))
    });
    RwLock::new(registered)
});

/// Registers a source factory under a URL scheme.
pub fn register(scheme: &'static str, factory: SourceFactory) {
    SOURCES.write().unwrap().insert(scheme, factory);
}

/// Opens a source from a URL such as `file:///etc/myapp/migrations`.
pub fn open(url: &str) -> Result<Box<dyn Source>, Error> {
    let scheme = url.split("://").next().filter(|s| *s != url);
    let scheme =
        scheme.ok_or_else(|| Error::app("source", format!("unsupported source URL {url:?}")))?;

    let factory = {
        let sources = SOURCES.read().unwrap();
        sources.get(scheme).copied()
    };

    match factory {
        Some(factory) => factory(url),
        None => Err(Error::app(
            "source",
            format!("unsupported source {scheme:?} found"),
        )),
    }
}
