//! Parent chain resolution and the root fetch policy.
//!
//! A derived object's chain is declared child-first, but the engine
//! applies transforms parent-to-child on the root bytes, so the
//! accumulated chains are reversed. Fetching races a GET for the derived
//! artifact against a HEAD for the root (when parent checking is on)
//! under the request deadline; all selection is blocking, never spinning.

use std::sync::Arc;

use http::StatusCode;
use tokio::time::{Instant, timeout_at};
use tracing::warn;

use crate::object::{DerivedObject, TransformChain};
use crate::response::Response;
use crate::storage::StorageDispatcher;

/// Outcome of the root fetch policy.
pub enum RootFetch {
    /// The derived artifact already exists on storage.
    Direct(Response),
    /// The root was fetched and an engine pass is required.
    Process {
        parent: Response,
        chains: Vec<TransformChain>,
    },
    /// A response to surface as-is (404s, pass-through statuses).
    Surfaced(Response),
    /// The parent lookup failed; the caller takes the placeholder path.
    Failed { status: StatusCode, error: String },
    /// The request deadline elapsed mid-fetch.
    TimedOut,
}

/// Walks derived→parent chains and applies the fetch policy.
pub struct ParentResolver {
    storage: Arc<StorageDispatcher>,
}

impl ParentResolver {
    pub fn new(storage: Arc<StorageDispatcher>) -> Self {
        Self { storage }
    }

    /// Walk the parent chain, accumulating transform chains child-first,
    /// and reverse them into application order. Returns the root object.
    pub fn resolve(obj: &DerivedObject) -> (&DerivedObject, Vec<TransformChain>) {
        let mut chains = Vec::new();
        let mut current = obj;
        while let Some(parent) = current.parent.as_deref() {
            if current.has_transforms() {
                chains.push(current.transforms.clone());
            }
            current = parent;
        }
        chains.reverse();
        (current, chains)
    }

    /// Fetch the derived artifact, falling back to the root per policy:
    ///
    /// 1. GET 200 (and HEAD 200 when parent checking) serves directly.
    /// 2. GET 404 takes the not-found path: verify the root, then fetch
    ///    its bytes for the engine when it is a transformable image.
    /// 3. Any other GET status is surfaced.
    /// 4. Deadline elapse yields `TimedOut`.
    pub async fn fetch(&self, obj: &DerivedObject, deadline: Instant) -> RootFetch {
        let (root, chains) = Self::resolve(obj);

        if !obj.has_parent() {
            let res = match timeout_at(deadline, self.storage.get(obj)).await {
                Ok(res) => res,
                Err(_) => return RootFetch::TimedOut,
            };
            return match res.status() {
                StatusCode::OK => RootFetch::Direct(res),
                _ => RootFetch::Surfaced(res),
            };
        }

        let get_fut = self.storage.get(obj);
        let head_fut = self.storage.head(root);
        tokio::pin!(get_fut, head_fut);

        let mut get_res: Option<Response> = None;
        let mut head_res: Option<Response> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return RootFetch::TimedOut,
                res = &mut get_fut, if get_res.is_none() => {
                    get_res = Some(res);
                }
                res = &mut head_fut, if obj.check_parent && head_res.is_none() => {
                    if res.status() == StatusCode::NOT_FOUND {
                        warn!(key = %obj.key, parent = %root.key, "missing parent for object");
                        return RootFetch::Surfaced(res);
                    }
                    head_res = Some(res);
                }
            }

            // A 200 is only servable once the parent check (if any) has
            // come back.
            if !obj.check_parent || head_res.is_some() {
                if let Some(res) = get_res.take() {
                    return self.conclude(obj, root, chains, res, head_res.take(), deadline).await;
                }
            }
        }
    }

    async fn conclude(
        &self,
        obj: &DerivedObject,
        root: &DerivedObject,
        chains: Vec<TransformChain>,
        res: Response,
        head_res: Option<Response>,
        deadline: Instant,
    ) -> RootFetch {
        match res.status() {
            StatusCode::OK => RootFetch::Direct(res),
            StatusCode::NOT_FOUND => {
                let head = match head_res {
                    Some(head) => head,
                    // Parent checking was off, so the root has not been
                    // looked at yet.
                    None => match timeout_at(deadline, self.storage.head(root)).await {
                        Ok(head) => head,
                        Err(_) => return RootFetch::TimedOut,
                    },
                };

                if head.status() == StatusCode::NOT_FOUND {
                    warn!(key = %obj.key, parent = %root.key, "missing parent for object");
                    return RootFetch::Surfaced(head);
                }
                if !head.status().is_success() {
                    return RootFetch::Failed {
                        status: head.status(),
                        error: head
                            .error_message()
                            .unwrap_or("parent lookup failed")
                            .to_string(),
                    };
                }

                if obj.has_transforms() && head.is_image() {
                    let parent = match timeout_at(deadline, self.storage.get(root)).await {
                        Ok(parent) => parent,
                        Err(_) => return RootFetch::TimedOut,
                    };
                    if parent.status() != StatusCode::OK {
                        return RootFetch::Surfaced(parent);
                    }
                    RootFetch::Process { parent, chains }
                } else {
                    warn!(
                        key = %obj.key,
                        parent = %root.key,
                        content_type = head.content_type().unwrap_or("unknown"),
                        "not performing transforms"
                    );
                    RootFetch::Surfaced(res)
                }
            }
            _ => RootFetch::Surfaced(res),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{StorageTarget, Transform};

    fn with_transforms(key: &str, ops: Vec<Transform>, parent: DerivedObject) -> DerivedObject {
        DerivedObject {
            bucket: "demo".to_string(),
            key: key.to_string(),
            storage_target: StorageTarget::Transform,
            transforms: TransformChain::new(ops),
            parent: Some(Box::new(parent)),
            check_parent: false,
            debug: false,
        }
    }

    #[test]
    fn chains_are_reversed_into_application_order() {
        let root = DerivedObject::plain("demo", "/img.jpg");
        let a = with_transforms("/a", vec![Transform::Rotate { angle: 90 }], root);
        let b = with_transforms("/b", vec![Transform::Grayscale], a);
        let c = with_transforms("/c", vec![Transform::Blur { sigma: 2.0 }], b);

        let (resolved_root, chains) = ParentResolver::resolve(&c);
        assert_eq!(resolved_root.key, "/img.jpg");
        assert_eq!(chains.len(), 3);
        assert_eq!(chains[0].ops(), &[Transform::Rotate { angle: 90 }]);
        assert_eq!(chains[1].ops(), &[Transform::Grayscale]);
        assert_eq!(chains[2].ops(), &[Transform::Blur { sigma: 2.0 }]);
    }

    #[test]
    fn links_without_transforms_contribute_nothing() {
        let root = DerivedObject::plain("demo", "/img.jpg");
        let passthrough = with_transforms("/p", Vec::new(), root);
        let leaf = with_transforms("/l", vec![Transform::Grayscale], passthrough);

        let (resolved_root, chains) = ParentResolver::resolve(&leaf);
        assert_eq!(resolved_root.key, "/img.jpg");
        assert_eq!(chains.len(), 1);
    }

    #[test]
    fn plain_objects_resolve_to_themselves() {
        let obj = DerivedObject::plain("demo", "/img.jpg");
        let (root, chains) = ParentResolver::resolve(&obj);
        assert_eq!(root.key, "/img.jpg");
        assert!(chains.is_empty());
    }
}
