//! Type-to-namespace mapping for simple documents

use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::RwLock;

/// A document type stored under a namespace derived from the type itself.
///
/// Override `NAMESPACE` to pin the name; otherwise it is
/// `autotype_<lowercased type path>`, which changes if the type is moved
/// or renamed.
pub trait SimpleDocument: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAMESPACE: Option<&'static str> = None;
}

lazy_static! {
    static ref NAMESPACES: RwLock<HashMap<TypeId, String>> = RwLock::new(HashMap::new());
}

/// Namespace for `T`, computed once per type
pub fn resolve<T: SimpleDocument>() -> String {
    let id = TypeId::of::<T>();
    if let Ok(map) = NAMESPACES.read() {
        if let Some(ns) = map.get(&id) {
            return ns.clone();
        }
    }

    let ns = match T::NAMESPACE {
        Some(ns) => ns.to_string(),
        None => format!("autotype_{}", std::any::type_name::<T>().to_lowercase()),
    };
    if let Ok(mut map) = NAMESPACES.write() {
        map.entry(id).or_insert_with(|| ns.clone());
    }
    ns
}
