//! Modules guest code can `require`.
//!
//! The registry holds every module the host knows about. A
//! [`ModulePolicy`] decides which of them a guest may load directly;
//! dependencies of allowed external modules are loadable only when the
//! policy allows transitive loading.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::config::ModulePolicy;

/// Origin of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// Ships with the sandbox.
    Builtin,
    /// Installed by the operator.
    External,
}

/// One loadable JavaScript module.
///
/// `source` is a CommonJS body: it runs with `module`, `exports` and
/// `require` in scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    /// Name passed to `require`.
    pub name: String,
    /// Origin.
    pub kind: ModuleKind,
    /// Module body.
    pub source: String,
    /// Names this module `require`s.
    pub requires: Vec<String>,
}

impl ModuleSource {
    /// Module with no dependencies.
    pub fn new(name: impl Into<String>, kind: ModuleKind, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            source: source.into(),
            requires: Vec::new(),
        }
    }

    /// Declares a dependency.
    pub fn requiring(mut self, name: impl Into<String>) -> Self {
        self.requires.push(name.into());
        self
    }
}

/// Every module the host can offer.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleSource>,
}

impl ModuleRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in modules.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ModuleSource::new("util", ModuleKind::Builtin, UTIL_MODULE));
        registry
    }

    /// Adds or replaces a module.
    pub fn register(&mut self, module: ModuleSource) -> &mut Self {
        self.modules.insert(module.name.clone(), module);
        self
    }

    /// Module named `name`.
    pub fn get(&self, name: &str) -> Option<&ModuleSource> {
        self.modules.get(name)
    }

    /// Applies `policy` to the registry.
    pub fn resolve(&self, policy: &ModulePolicy) -> ResolvedModules {
        let direct: BTreeSet<String> = self
            .modules
            .values()
            .filter(|module| match module.kind {
                ModuleKind::Builtin => policy.allows_builtin(&module.name),
                ModuleKind::External => policy.allows_external(&module.name),
            })
            .map(|module| module.name.clone())
            .collect();

        let mut loadable = direct.clone();
        if policy.allow_transitive {
            let mut queue: VecDeque<&str> = direct.iter().map(String::as_str).collect();
            while let Some(name) = queue.pop_front() {
                let Some(module) = self.modules.get(name) else {
                    continue;
                };
                for dependency in &module.requires {
                    if self.modules.contains_key(dependency) && loadable.insert(dependency.clone()) {
                        queue.push_back(dependency.as_str());
                    }
                }
            }
        }

        ResolvedModules {
            known: self.modules.keys().cloned().collect(),
            direct,
            modules: loadable
                .iter()
                .filter_map(|name| self.modules.get(name).cloned())
                .collect(),
        }
    }
}

/// Outcome of applying a policy to a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedModules {
    /// Every registered name, used to tell "disallowed" from "missing".
    pub known: BTreeSet<String>,
    /// Names guest code may `require` itself.
    pub direct: BTreeSet<String>,
    /// Modules that may be loaded at all: direct plus transitive.
    pub modules: Vec<ModuleSource>,
}

impl ResolvedModules {
    /// Names that may be loaded at all.
    pub fn loadable(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|module| module.name.as_str())
    }
}

const UTIL_MODULE: &str = r#"
function render(value) {
  if (typeof value === "string") return value;
  try {
    return JSON.stringify(value);
  } catch (e) {
    return String(value);
  }
}

function format(template) {
  const args = Array.prototype.slice.call(arguments, 1);
  if (typeof template !== "string") {
    return [template].concat(args).map(render).join(" ");
  }
  let used = 0;
  const text = template.replace(/%[sdjo%]/g, function (token) {
    if (token === "%%") return "%";
    if (used >= args.length) return token;
    const arg = args[used++];
    if (token === "%d") return String(Number(arg));
    if (token === "%s") return String(arg);
    return render(arg);
  });
  return [text].concat(args.slice(used).map(render)).join(" ");
}

function isDeepStrictEqual(a, b) {
  return JSON.stringify(a) === JSON.stringify(b);
}

module.exports = {
  format: format,
  inspect: function (value) { return JSON.stringify(value, null, 2); },
  isDeepStrictEqual: isDeepStrictEqual,
};
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::with_builtins();
        registry
            .register(
                ModuleSource::new("greeter", ModuleKind::External, "module.exports = 1;")
                    .requiring("left-pad"),
            )
            .register(ModuleSource::new("left-pad", ModuleKind::External, "module.exports = 2;"));
        registry
    }

    fn names(resolved: &ResolvedModules) -> Vec<&str> {
        resolved.loadable().collect()
    }

    #[test]
    fn empty_policy_allows_nothing() {
        let resolved = registry().resolve(&ModulePolicy::default());
        assert!(resolved.direct.is_empty());
        assert!(resolved.modules.is_empty());
        assert_eq!(resolved.known.len(), 3);
    }

    #[test]
    fn dependencies_are_not_loadable_without_transitive() {
        let policy = ModulePolicy {
            external: vec!["greeter".into()],
            ..ModulePolicy::default()
        };
        let resolved = registry().resolve(&policy);
        assert_eq!(names(&resolved), vec!["greeter"]);
    }

    #[test]
    fn transitive_policy_pulls_in_dependencies_but_not_as_direct() {
        let policy = ModulePolicy {
            external: vec!["greeter".into()],
            allow_transitive: true,
            ..ModulePolicy::default()
        };
        let resolved = registry().resolve(&policy);
        assert_eq!(names(&resolved), vec!["greeter", "left-pad"]);
        assert!(!resolved.direct.contains("left-pad"));
    }

    #[test]
    fn wildcard_is_per_kind() {
        let policy = ModulePolicy {
            builtin: vec!["*".into()],
            ..ModulePolicy::default()
        };
        let resolved = registry().resolve(&policy);
        assert_eq!(names(&resolved), vec!["util"]);
    }
}
