//! Pre/post request hooks.
//!
//! Hooks observe requests entering the dispatcher and responses leaving
//! it. They run synchronously on the request path, so implementations
//! must stay cheap.

use std::sync::Arc;

use crate::object::DerivedObject;
use crate::processor::RequestMeta;
use crate::response::Response;

/// A hook invoked around request processing.
pub trait ProcessorHook: Send + Sync {
    /// Called before the request is enqueued.
    fn pre_process(&self, _obj: &DerivedObject, _meta: &RequestMeta) {}

    /// Called after a response is produced, before it is returned.
    /// Hooks may mutate the response (e.g. stamp headers).
    fn post_process(&self, _obj: &DerivedObject, _meta: &RequestMeta, _res: &mut Response) {}
}

/// Ordered collection of hooks.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn ProcessorHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn ProcessorHook>) {
        self.hooks.push(hook);
    }

    pub(crate) fn pre_process(&self, obj: &DerivedObject, meta: &RequestMeta) {
        for hook in &self.hooks {
            hook.pre_process(obj, meta);
        }
    }

    pub(crate) fn post_process(&self, obj: &DerivedObject, meta: &RequestMeta, res: &mut Response) {
        for hook in &self.hooks {
            hook.post_process(obj, meta, res);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        pre: AtomicUsize,
        post: AtomicUsize,
    }

    impl ProcessorHook for CountingHook {
        fn pre_process(&self, _obj: &DerivedObject, _meta: &RequestMeta) {
            self.pre.fetch_add(1, Ordering::SeqCst);
        }

        fn post_process(&self, _obj: &DerivedObject, _meta: &RequestMeta, res: &mut Response) {
            self.post.fetch_add(1, Ordering::SeqCst);
            res.set_header("X-Hooked", "1");
        }
    }

    #[test]
    fn hooks_run_in_registration_order_and_mutate() {
        let hook = Arc::new(CountingHook {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
        });
        let mut registry = HookRegistry::new();
        registry.register(hook.clone());

        let obj = DerivedObject::plain("demo", "/img.jpg");
        let meta = RequestMeta::new(Method::GET);
        registry.pre_process(&obj, &meta);

        let mut res = Response::empty(StatusCode::OK);
        registry.post_process(&obj, &meta, &mut res);

        assert_eq!(hook.pre.load(Ordering::SeqCst), 1);
        assert_eq!(hook.post.load(Ordering::SeqCst), 1);
        assert_eq!(res.headers().get("X-Hooked").unwrap(), "1");
    }
}
