//! # Route Registry
//!
//! Replaces reflective class-path scanning with Rust's own compile-time
//! registration: a route is declared by submitting a [`RouteDescriptor`] via
//! `inventory::submit!` from wherever it's defined, and [`RouteRegistry::build`]
//! gathers every submission crate-wide at link time — no central list to
//! maintain, no runtime classpath walk.

use crate::error::{RpcError, RpcResult};
use crate::invoke::Controller;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::warn;

/// A compile-time route declaration, collected via `inventory`.
///
/// `module_path` is checked against the configured `base_packages` list so
/// a registry build can scope itself to one namespace the way the original
/// classpath scan scoped itself to a Java package prefix. `controller_prefix`
/// is the prefix the owning controller declares; the registered key is
/// `controller_prefix + target_suffix`, both normalized.
pub struct RouteDescriptor {
    pub controller_prefix: &'static str,
    pub target_suffix: &'static str,
    pub loggable: bool,
    pub auth_required: bool,
    pub module_path: &'static str,
    pub factory: fn() -> Box<dyn Controller>,
}

inventory::collect!(RouteDescriptor);

/// How to handle two descriptors normalizing to the same target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateRoutePolicy {
    /// Keep the most recently registered route, logging a warning.
    WarnAndOverwrite,
    /// Fail the registry build outright.
    Fatal,
}

impl Default for DuplicateRoutePolicy {
    fn default() -> Self {
        DuplicateRoutePolicy::WarnAndOverwrite
    }
}

/// A resolved, ready-to-invoke route.
pub struct RouteEntry {
    pub target: String,
    pub loggable: bool,
    pub auth_required: bool,
    controller: Box<dyn Controller>,
}

impl RouteEntry {
    pub fn controller(&self) -> &dyn Controller {
        self.controller.as_ref()
    }

    #[cfg(test)]
    pub fn for_test(
        target: String,
        loggable: bool,
        auth_required: bool,
        controller: Box<dyn Controller>,
    ) -> Self {
        Self {
            target,
            loggable,
            auth_required,
            controller,
        }
    }
}

/// Normalize a raw target path: empty stays empty; otherwise lower-case,
/// trim, ensure a leading slash, collapse repeated slashes, and strip a
/// trailing slash unless the path is the root.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let lowered = trimmed.to_lowercase();
    let mut out = String::with_capacity(lowered.len() + 1);
    if !lowered.starts_with('/') {
        out.push('/');
    }
    let mut last_was_slash = false;
    for ch in lowered.chars() {
        if ch == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(ch);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// The concurrent target → route mapping, built once and read by every
/// connection task thereafter.
#[derive(Clone)]
pub struct RouteRegistry {
    routes: DashMap<String, Arc<RouteEntry>>,
}

impl RouteRegistry {
    /// Build a registry from every `RouteDescriptor` submitted crate-wide,
    /// filtered to descriptors whose `module_path` falls under one of
    /// `base_packages`. An empty `base_packages` accepts every descriptor.
    pub fn build(base_packages: &[String], policy: DuplicateRoutePolicy) -> RpcResult<Self> {
        let routes: DashMap<String, Arc<RouteEntry>> = DashMap::new();

        for descriptor in inventory::iter::<RouteDescriptor> {
            if !base_packages.is_empty()
                && !base_packages
                    .iter()
                    .any(|base| descriptor.module_path.starts_with(base.as_str()))
            {
                continue;
            }

            // §4.2: "the full route key is `prefix + suffix` after both are
            // normalized." Each part is normalized on its own first; the
            // concatenation is then re-normalized once more so a root
            // controller prefix ("/") plus a leading-slash suffix doesn't
            // leave a doubled slash in the registered key.
            let prefix = normalize(descriptor.controller_prefix);
            let suffix = normalize(descriptor.target_suffix);
            let target = normalize(&format!("{prefix}{suffix}"));
            let entry = Arc::new(RouteEntry {
                target: target.clone(),
                loggable: descriptor.loggable,
                auth_required: descriptor.auth_required,
                controller: (descriptor.factory)(),
            });

            if routes.contains_key(&target) {
                match policy {
                    DuplicateRoutePolicy::WarnAndOverwrite => {
                        warn!(target = %target, "duplicate route registration, overwriting");
                        routes.insert(target, entry);
                    }
                    DuplicateRoutePolicy::Fatal => {
                        return Err(RpcError::DuplicateRoute(target));
                    }
                }
            } else {
                routes.insert(target, entry);
            }
        }

        Ok(Self { routes })
    }

    /// Exact-match lookup, falling back to the longest registered prefix of
    /// `target` (splitting on `/`) if no exact route exists.
    pub fn lookup(&self, target: &str) -> Option<Arc<RouteEntry>> {
        let normalized = normalize(target);
        if let Some(entry) = self.routes.get(&normalized) {
            return Some(Arc::clone(entry.value()));
        }

        let mut candidate = normalized.as_str();
        while let Some(idx) = candidate.rfind('/') {
            if idx == 0 {
                break;
            }
            candidate = &candidate[..idx];
            if let Some(entry) = self.routes.get(candidate) {
                return Some(Arc::clone(entry.value()));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Build a registry directly from already-resolved entries, bypassing
    /// the `inventory` scan. Used by tests that want a registry containing
    /// exactly one or two hand-built routes.
    #[cfg(test)]
    pub fn from_entries(entries: Vec<RouteEntry>) -> Self {
        let routes = DashMap::new();
        for entry in entries {
            routes.insert(entry.target.clone(), Arc::new(entry));
        }
        Self { routes }
    }
}

static REGISTRY: OnceCell<RouteRegistry> = OnceCell::const_new();

/// Initialize the process-wide registry exactly once. Concurrent callers
/// racing this during startup all observe the same built registry; none
/// build it twice.
pub async fn init_registry(
    base_packages: &[String],
    policy: DuplicateRoutePolicy,
) -> RpcResult<()> {
    REGISTRY
        .get_or_try_init(|| async { RouteRegistry::build(base_packages, policy) })
        .await?;
    Ok(())
}

/// Fetch the initialized registry, polling briefly for a concurrent
/// in-flight `init_registry` to finish before giving up.
pub async fn get_registry() -> RpcResult<&'static RouteRegistry> {
    if let Some(registry) = REGISTRY.get() {
        return Ok(registry);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if let Some(registry) = REGISTRY.get() {
            return Ok(registry);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err(RpcError::RegistryNotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_leading_slash_and_collapses_repeats() {
        assert_eq!(normalize("inet/head"), "/inet/head");
        assert_eq!(normalize("//inet///head//"), "/inet/head");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("/Inet/Head"), "/inet/head");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["/a/b/", "a/b", "", "/", "//x//y//", "MiXeD/Case/"] {
            assert_eq!(normalize(raw), normalize(&normalize(raw)));
        }
    }

    #[test]
    fn lookup_falls_back_to_longest_prefix() {
        let routes = DashMap::new();
        let registry = RouteRegistry { routes };
        registry.routes.insert(
            "/inet".to_string(),
            Arc::new(RouteEntry {
                target: "/inet".to_string(),
                loggable: true,
                auth_required: false,
                controller: Box::new(crate::invoke::test_support::EchoController),
            }),
        );

        assert!(registry.lookup("/inet/head/sub").is_some());
        assert!(registry.lookup("/unrelated").is_none());
    }

    fn echo_factory() -> Box<dyn Controller> {
        Box::new(crate::invoke::test_support::EchoController)
    }

    inventory::submit! {
        RouteDescriptor {
            controller_prefix: "/Inet/",
            target_suffix: "head/",
            loggable: true,
            auth_required: false,
            module_path: module_path!(),
            factory: echo_factory,
        }
    }

    #[test]
    fn build_composes_normalized_prefix_and_suffix_into_the_route_key() {
        let registry = RouteRegistry::build(&[], DuplicateRoutePolicy::WarnAndOverwrite).unwrap();
        assert!(registry.routes.contains_key("/inet/head"));
    }
}
