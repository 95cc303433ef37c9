//! Name-hash keyed constructor tables.
//!
//! A [`Factory`] serves one interface family: it maps the [`name_hash`] of an
//! implementation name to a constructor closure with a family-specific
//! argument type `A`. Entries are added during the startup registration phase
//! (which needs `&mut self`) and are never removed; afterwards the table is
//! only read, so it can be shared behind an `Arc` and used from many threads.
//!
//! ```rust
//! use daq_core::factory::Factory;
//!
//! trait Greeter: Send { fn greet(&self) -> String; }
//! struct Hello(String);
//! impl Greeter for Hello { fn greet(&self) -> String { format!("hello {}", self.0) } }
//!
//! let mut greeters: Factory<dyn Greeter, String> = Factory::new("Greeter");
//! greeters.register("Hello", |who| Ok(Box::new(Hello(who)))).unwrap();
//! let g = greeters.create_by_name("Hello", "run control".into()).unwrap();
//! assert_eq!(g.greet(), "hello run control");
//! ```

use crate::error::{DaqError, RegistryError};
use crate::hash::name_hash;
use std::collections::HashMap;

/// Boxed constructor stored in a [`Factory`].
pub type Constructor<T, A> = Box<dyn Fn(A) -> Result<Box<T>, DaqError> + Send + Sync>;

struct Entry<T: ?Sized, A> {
    name: String,
    ctor: Constructor<T, A>,
}

pub struct Factory<T: ?Sized, A> {
    family: &'static str,
    entries: HashMap<u32, Entry<T, A>>,
}

impl<T: ?Sized, A> Factory<T, A> {
    pub fn new(family: &'static str) -> Self {
        Self {
            family,
            entries: HashMap::new(),
        }
    }

    pub fn family(&self) -> &'static str {
        self.family
    }

    /// Register `name` under `name_hash(name)`.
    pub fn register<F>(&mut self, name: &str, ctor: F) -> Result<u32, RegistryError>
    where
        F: Fn(A) -> Result<Box<T>, DaqError> + Send + Sync + 'static,
    {
        let id = name_hash(name);
        self.register_with_id(id, name, ctor)?;
        Ok(id)
    }

    /// Register under an explicit id.
    ///
    /// An occupied id is rejected: [`RegistryError::Duplicate`] if the same
    /// name was registered before, [`RegistryError::Collision`] otherwise.
    pub fn register_with_id<F>(&mut self, id: u32, name: &str, ctor: F) -> Result<(), RegistryError>
    where
        F: Fn(A) -> Result<Box<T>, DaqError> + Send + Sync + 'static,
    {
        if let Some(existing) = self.entries.get(&id) {
            return Err(if existing.name == name {
                RegistryError::Duplicate {
                    family: self.family,
                    name: name.to_string(),
                }
            } else {
                RegistryError::Collision {
                    family: self.family,
                    id,
                    name: name.to_string(),
                    existing: existing.name.clone(),
                }
            });
        }

        tracing::debug!(family = self.family, name, id = format_args!("{:#010x}", id), "registered");
        self.entries.insert(
            id,
            Entry {
                name: name.to_string(),
                ctor: Box::new(ctor),
            },
        );
        Ok(())
    }

    /// Construct the implementation registered under `id`.
    pub fn create(&self, id: u32, args: A) -> Result<Box<T>, DaqError> {
        let entry = self.entries.get(&id).ok_or(RegistryError::UnknownType {
            family: self.family,
            id,
            name: None,
        })?;
        (entry.ctor)(args)
    }

    pub fn create_by_name(&self, name: &str, args: A) -> Result<Box<T>, DaqError> {
        let id = name_hash(name);
        let entry = self.entries.get(&id).ok_or_else(|| RegistryError::UnknownType {
            family: self.family,
            id,
            name: Some(name.to_string()),
        })?;
        (entry.ctor)(args)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.contains(name_hash(name))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.values().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.entries.get(&id).map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: ?Sized, A> std::fmt::Debug for Factory<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("family", &self.family)
            .field("names", &self.names())
            .finish()
    }
}
