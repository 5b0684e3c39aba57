//! Build artifacts handed from producing tasks to consuming tasks.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::ArcStr;

/// The kind of a [`Product`], used when tasks declare what they produce and
/// consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProductKind {
    Classes,
    Artifact,
    Resources,
    Marker,
}

impl Display for ProductKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProductKind::Classes => "classes",
            ProductKind::Artifact => "artifact",
            ProductKind::Resources => "resources",
            ProductKind::Marker => "marker",
        })
    }
}

/// A typed build artifact. Products are plain values; once published they
/// are only ever read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Product {
    /// Directory of compiled classes.
    Classes { dir: Utf8PathBuf },
    /// Packaged artifact, optionally with a sources archive next to it.
    Artifact {
        main: Utf8PathBuf,
        sources: Option<Utf8PathBuf>,
    },
    /// Root of a resource tree.
    Resources { root: Utf8PathBuf },
    /// Output of a task that leaves nothing on disk, e.g. a passed check.
    Marker { justification: String },
}

impl Product {
    pub fn classes(dir: impl Into<Utf8PathBuf>) -> Self {
        Product::Classes { dir: dir.into() }
    }

    pub fn artifact(main: impl Into<Utf8PathBuf>) -> Self {
        Product::Artifact {
            main: main.into(),
            sources: None,
        }
    }

    pub fn artifact_with_sources(
        main: impl Into<Utf8PathBuf>,
        sources: impl Into<Utf8PathBuf>,
    ) -> Self {
        Product::Artifact {
            main: main.into(),
            sources: Some(sources.into()),
        }
    }

    pub fn resources(root: impl Into<Utf8PathBuf>) -> Self {
        Product::Resources { root: root.into() }
    }

    pub fn marker(justification: impl Into<String>) -> Self {
        Product::Marker {
            justification: justification.into(),
        }
    }

    pub fn kind(&self) -> ProductKind {
        match self {
            Product::Classes { .. } => ProductKind::Classes,
            Product::Artifact { .. } => ProductKind::Artifact,
            Product::Resources { .. } => ProductKind::Resources,
            Product::Marker { .. } => ProductKind::Marker,
        }
    }
}

/// Products published during one run, keyed by the producing task.
#[derive(Clone, Default)]
pub(crate) struct ProductStore {
    published: Arc<Mutex<HashMap<ArcStr, Vec<Arc<Product>>>>>,
}

impl ProductStore {
    pub(crate) fn publish(&self, task: &ArcStr, product: Product) -> Arc<Product> {
        let product = Arc::new(product);
        let mut published = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        published
            .entry(task.clone())
            .or_default()
            .push(product.clone());

        product
    }

    /// Products of `kind` published by `tasks`, in the given task order.
    pub(crate) fn collect<'a>(
        &self,
        tasks: impl IntoIterator<Item = &'a ArcStr>,
        kind: ProductKind,
    ) -> Vec<Arc<Product>> {
        let published = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        tasks
            .into_iter()
            .filter_map(|task| published.get(task))
            .flatten()
            .filter(|product| product.kind() == kind)
            .cloned()
            .collect()
    }

    pub(crate) fn take(self) -> HashMap<ArcStr, Vec<Arc<Product>>> {
        match Arc::try_unwrap(self.published) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind() {
        assert_eq!(Product::classes("out").kind(), ProductKind::Classes);
        assert_eq!(
            Product::artifact_with_sources("a.jar", "a-sources.jar").kind(),
            ProductKind::Artifact
        );
        assert_eq!(Product::resources("res").kind(), ProductKind::Resources);
        assert_eq!(Product::marker("checked").kind(), ProductKind::Marker);
    }

    #[test]
    fn test_serde_tagged() {
        let json = serde_json::to_string(&Product::artifact("lib.jar")).unwrap();
        assert_eq!(json, r#"{"kind":"artifact","main":"lib.jar","sources":null}"#);
    }

    #[test]
    fn test_store_collects_in_task_order() {
        let store = ProductStore::default();
        let a: ArcStr = "a".into();
        let b: ArcStr = "b".into();

        store.publish(&b, Product::classes("b/classes"));
        store.publish(&a, Product::classes("a/classes"));
        store.publish(&a, Product::marker("a ok"));

        let classes = store.collect([&a, &b], ProductKind::Classes);
        assert_eq!(
            classes.iter().map(|p| p.as_ref().clone()).collect::<Vec<_>>(),
            vec![Product::classes("a/classes"), Product::classes("b/classes")]
        );

        let markers = store.collect([&b], ProductKind::Marker);
        assert!(markers.is_empty());

        let all = store.take();
        assert_eq!(all[&a].len(), 2);
    }
}
