//! Method registry — binds construction names to implementations.
//!
//! Each method name carries an ordered list of providers (an
//! architecture-specific implementation would come first, the portable
//! fallback last). At startup the registry binds the first provider whose
//! availability probe passes; a configuration hook can override that
//! choice by provider name.

use crate::method::generic_poly1305::SALSA2012_POLY1305;
use crate::method::null::NULL;
use crate::method::Method;

/// Opaque tag shared by all providers of one construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: &'static str,
}

/// One implementation of a construction.
pub struct Provider {
    pub name: &'static str,
    /// Runtime availability probe. `None` means always available.
    pub available: Option<fn() -> bool>,
    pub method: &'static dyn Method,
}

struct Entry {
    info: MethodInfo,
    providers: Vec<Provider>,
    /// Index of the bound provider, if any probe passed.
    chosen: Option<usize>,
}

pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    /// The built-in constructions in their default provider order.
    pub fn with_defaults() -> Registry {
        let mut registry = Registry {
            entries: Vec::new(),
        };
        registry.register(
            "null",
            vec![Provider {
                name: "portable",
                available: None,
                method: &NULL,
            }],
        );
        registry.register(
            "salsa2012+poly1305",
            vec![Provider {
                name: "portable",
                available: None,
                method: &SALSA2012_POLY1305,
            }],
        );
        registry
    }

    /// Register a construction; binds the first available provider.
    pub fn register(&mut self, name: &'static str, providers: Vec<Provider>) {
        let chosen = providers
            .iter()
            .position(|p| p.available.map_or(true, |probe| probe()));
        self.entries.push(Entry {
            info: MethodInfo { name },
            providers,
            chosen,
        });
    }

    /// Configuration hook: force a specific provider for a construction.
    /// Returns false if the method or provider name is unknown.
    pub fn select_provider(&mut self, method: &str, provider: &str) -> bool {
        for entry in &mut self.entries {
            if entry.info.name != method {
                continue;
            }
            if let Some(index) = entry.providers.iter().position(|p| p.name == provider) {
                entry.chosen = Some(index);
                return true;
            }
            return false;
        }
        false
    }

    /// Look up a construction by name, yielding its info tag and the bound
    /// implementation.
    pub fn get(&self, name: &str) -> Option<(MethodInfo, &'static dyn Method)> {
        self.entries
            .iter()
            .find(|e| e.info.name == name)
            .and_then(|e| {
                e.chosen
                    .map(|index| (e.info, e.providers[index].method))
            })
    }
}
