//! Proxy registry for turning resolved resources into typed handles.
//!
//! [`Portal::open_connection_to`](crate::Portal::open_connection_to) yields an untyped
//! [`RemoteObject`]. Applications that prefer a typed API register a constructor per resource name,
//! and [`Portal::open_proxy`](crate::Portal::open_proxy) builds the typed proxy through it.

use std::{
    any::Any,
    borrow::{Borrow, Cow},
    collections::HashMap,
    fmt,
    hash::Hash,
};

use serde::de::DeserializeOwned;

use crate::{
    codec::Payload,
    envelope::Invocation,
    error::{RemoteError, Result},
    id::NodeId,
    portal::Portal,
};

type AnyConstructor = Box<dyn Any + Send + Sync>;
type Constructor<T> = Box<dyn Fn(RemoteObject) -> T + Send + Sync>;

/// A registry of proxy constructors, keyed by resource name.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    constructors: HashMap<Cow<'static, str>, AnyConstructor>,
}

impl ProxyRegistry {
    /// Creates a new empty proxy registry.
    pub fn new() -> Self {
        ProxyRegistry {
            constructors: HashMap::new(),
        }
    }

    /// The number of registered constructors.
    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    /// Returns `true` if the registry contains no constructors.
    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// Returns `true` if a constructor has been registered under a given name.
    pub fn contains_name<Q>(&self, name: &Q) -> bool
    where
        Q: Hash + Eq + ?Sized,
        Cow<'static, str>: Borrow<Q>,
    {
        self.constructors.contains_key(name)
    }

    /// Registers the constructor for proxies of `name`.
    ///
    /// Returns `false`, leaving the registry unchanged, if the name is already taken.
    pub fn insert<T, F>(&mut self, name: impl Into<Cow<'static, str>>, constructor: F) -> bool
    where
        T: 'static,
        F: Fn(RemoteObject) -> T + Send + Sync + 'static,
    {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return false;
        }

        let constructor: Constructor<T> = Box::new(constructor);
        self.constructors.insert(name, Box::new(constructor));
        true
    }

    /// Builds a proxy of type `T` for `name` around `remote`.
    ///
    /// Returns `Ok(None)` if nothing is registered under the name, and
    /// [`RemoteError::BadProxyType`] if the registered constructor produces a different type.
    pub fn build<T, Q>(&self, name: &Q, remote: RemoteObject) -> Result<Option<T>>
    where
        T: 'static,
        Q: Hash + Eq + fmt::Display + ?Sized,
        Cow<'static, str>: Borrow<Q>,
    {
        self.constructors
            .get(name)
            .map(|constructor| {
                constructor
                    .downcast_ref::<Constructor<T>>()
                    .map(|constructor| constructor(remote))
                    .ok_or_else(|| RemoteError::BadProxyType(name.to_string()))
            })
            .transpose()
    }

    /// Removes the constructor registered under a given name.
    pub fn remove<Q>(&mut self, name: &Q) -> bool
    where
        Q: Hash + Eq + ?Sized,
        Cow<'static, str>: Borrow<Q>,
    {
        self.constructors.remove(name).is_some()
    }
}

/// An untyped handle to an object served by a remote node.
#[derive(Clone, Debug)]
pub struct RemoteObject {
    portal: Portal,
    node_id: NodeId,
    object_name: String,
}

impl RemoteObject {
    pub(crate) fn new(portal: Portal, node_id: NodeId, object_name: String) -> Self {
        RemoteObject {
            portal,
            node_id,
            object_name,
        }
    }

    /// The node serving the object.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Name of the object on its node.
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Invokes a method and waits for its return value.
    pub async fn ask(&self, invocation: Invocation) -> Result<Option<Payload>> {
        self.portal.invoke(self.node_id, invocation).await
    }

    /// Invokes a method and decodes its return value into `R`.
    pub async fn ask_as<R>(&self, invocation: Invocation) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let method = invocation.method().to_string();
        let value = self
            .ask(invocation)
            .await?
            .ok_or_else(|| RemoteError::Decode(format!("method '{method}' returned no value")))?;
        value
            .decode()
            .map_err(|err| RemoteError::Decode(err.to_string()))
    }

    /// Invokes a method without waiting for it to run.
    pub async fn tell(&self, invocation: Invocation) -> Result<()> {
        self.portal.notify(self.node_id, invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{recipient::Methods, PortalConfig};

    #[derive(Debug)]
    struct Catalog(RemoteObject);
    #[derive(Debug)]
    struct Orders(#[allow(dead_code)] RemoteObject);

    fn remote() -> RemoteObject {
        let portal = Portal::new(Methods::new("test"), PortalConfig::default());
        RemoteObject::new(portal, NodeId::new(3), "catalog-service".into())
    }

    #[test]
    fn registered_constructor_builds_the_proxy() {
        let mut registry = ProxyRegistry::new();
        assert!(registry.insert("catalog", Catalog));
        assert!(!registry.insert("catalog", Catalog));

        let catalog = registry.build::<Catalog, _>("catalog", remote()).unwrap().unwrap();
        assert_eq!(catalog.0.node_id(), NodeId::new(3));
        assert_eq!(catalog.0.object_name(), "catalog-service");
    }

    #[test]
    fn wrong_type_is_rejected() {
        let mut registry = ProxyRegistry::new();
        registry.insert("catalog", Catalog);

        let err = registry.build::<Orders, _>("catalog", remote()).unwrap_err();
        assert!(matches!(err, RemoteError::BadProxyType(name) if name == "catalog"));
    }

    #[test]
    fn unknown_name_builds_nothing() {
        let registry = ProxyRegistry::new();
        assert!(registry.build::<Catalog, _>("catalog", remote()).unwrap().is_none());
    }

    #[test]
    fn removed_constructor_is_gone() {
        let mut registry = ProxyRegistry::new();
        registry.insert("catalog", Catalog);
        assert!(registry.contains_name("catalog"));
        assert!(registry.remove("catalog"));
        assert!(registry.is_empty());
    }
}
