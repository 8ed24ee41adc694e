//! Assembles the script the interpreter actually evaluates.
//!
//! Layout: the fixed prelude defining the guest API, the allowed module
//! factories, then the guest source wrapped as a function body. The
//! wrapper always completes with a JSON envelope string describing what
//! happened, so the host never has to walk live interpreter objects.

use serde_json::Value;

use crate::modules::ResolvedModules;

/// Script text plus where the guest source starts in it.
#[derive(Debug, Clone)]
pub(super) struct AssembledScript {
    pub(super) text: String,
    /// Lines preceding the first guest line.
    pub(super) guest_line_offset: u32,
}

pub(super) fn assemble(source: &str, modules: &ResolvedModules) -> AssembledScript {
    let mut text = String::with_capacity(PRELUDE.len() + WRAPPER_HEAD.len() + source.len() + WRAPPER_TAIL.len());
    text.push_str(PRELUDE);

    for module in &modules.modules {
        text.push_str("__nebulaModules.define(");
        text.push_str(&js_literal(&module.name));
        text.push_str(", function (module, exports, require) {\n");
        text.push_str(&module.source);
        text.push_str("\n});\n");
    }
    text.push_str("__nebulaModules.configure(");
    text.push_str(&js_list(modules.known.iter().map(String::as_str)));
    text.push_str(", ");
    text.push_str(&js_list(modules.direct.iter().map(String::as_str)));
    text.push_str(", ");
    text.push_str(&js_list(modules.loadable()));
    text.push_str(");\n");

    text.push_str(WRAPPER_HEAD);
    let guest_line_offset = text.matches('\n').count() as u32;
    text.push_str(source);
    text.push('\n');
    text.push_str(WRAPPER_TAIL);

    AssembledScript {
        text,
        guest_line_offset,
    }
}

fn js_literal(text: &str) -> String {
    Value::String(text.to_owned()).to_string()
}

fn js_list<'a>(names: impl Iterator<Item = &'a str>) -> String {
    Value::Array(names.map(Value::from).collect()).to_string()
}

const PRELUDE: &str = r#"const __nebula = JSON.parse(__nebulaPayload);

function __nebulaDescribeError(error) {
  if (error !== null && typeof error === "object") {
    return {
      message: "message" in error ? String(error.message) : String(error),
      name: "name" in error ? String(error.name) : null,
      stack: typeof error.stack === "string" ? error.stack : null,
    };
  }
  return { message: String(error), name: null, stack: null };
}

const console = (function () {
  function render(args) {
    const parts = [];
    for (let i = 0; i < args.length; i++) {
      const arg = args[i];
      if (typeof arg === "string") {
        parts.push(arg);
      } else if (arg instanceof Error) {
        parts.push(String(arg));
      } else if (arg !== null && typeof arg === "object") {
        try {
          parts.push(JSON.stringify(arg));
        } catch (e) {
          parts.push(String(arg));
        }
      } else {
        parts.push(String(arg));
      }
    }
    return parts.join(" ");
  }
  function emit(level) {
    return function () {
      __nebulaHostLog(level, render(arguments));
    };
  }
  return Object.freeze({
    log: emit("info"),
    info: emit("info"),
    debug: emit("debug"),
    warn: emit("warn"),
    error: emit("error"),
  });
})();

const $input = (function () {
  const items = __nebula.items;
  const api = {
    all: function () { return items; },
    first: function () { return items.length > 0 ? items[0] : undefined; },
    last: function () { return items.length > 0 ? items[items.length - 1] : undefined; },
  };
  if (__nebula.mode === "perItem") {
    api.item = items[0];
  }
  return Object.freeze(api);
})();
const $json = __nebula.mode === "perItem" && __nebula.items.length > 0 ? __nebula.items[0].data : undefined;
const $index = __nebula.itemIndex;
const $parameter = __nebula.parameters;

let __nebulaStaticData = __nebula.staticData;
function $getStaticData() {
  return __nebulaStaticData;
}

const $helpers = Object.freeze({
  httpRequest: function (options) {
    const request = typeof options === "string" ? { url: options } : options;
    return JSON.parse(__nebulaHostHttp(JSON.stringify(request)));
  },
  base64Encode: function (text) {
    return __nebulaHostBase64Encode(String(text));
  },
  base64Decode: function (encoded) {
    return __nebulaHostBase64Decode(String(encoded));
  },
  getBinaryDataBuffer: function (name, itemIndex) {
    let index = itemIndex;
    if (index === undefined) {
      index = __nebula.itemIndex === null ? 0 : __nebula.itemIndex;
    }
    return __nebulaHostBinary(index, String(name));
  },
});

const __nebulaModules = (function () {
  const factories = {};
  const cache = {};
  let known = new Set();
  let direct = new Set();
  let loadable = new Set();
  function load(name, allowed) {
    if (!known.has(name)) {
      throw new Error("Cannot find module '" + name + "'");
    }
    if (!allowed.has(name) || !Object.prototype.hasOwnProperty.call(factories, name)) {
      throw new Error("Module '" + name + "' is disallowed");
    }
    if (Object.prototype.hasOwnProperty.call(cache, name)) {
      return cache[name].exports;
    }
    const module = { exports: {} };
    cache[name] = module;
    factories[name](module, module.exports, function (dependency) {
      return load(String(dependency), loadable);
    });
    return module.exports;
  }
  return {
    define: function (name, factory) {
      factories[name] = factory;
    },
    configure: function (knownNames, directNames, loadableNames) {
      known = new Set(knownNames);
      direct = new Set(directNames);
      loadable = new Set(loadableNames);
    },
    require: function (name) {
      return load(String(name), direct);
    },
  };
})();
const require = __nebulaModules.require;
"#;

const WRAPPER_HEAD: &str = r#"(function () {
  const __nebulaOutcome = { ok: true, returned: null, error: null, serializationError: null, staticData: null };
  let __nebulaReturned;
  try {
    __nebulaReturned = (function () {
"#;

const WRAPPER_TAIL: &str = r#"    })();
  } catch (__nebulaError) {
    __nebulaOutcome.ok = false;
    __nebulaOutcome.error = __nebulaDescribeError(__nebulaError);
  }
  if (__nebulaOutcome.ok && __nebulaReturned !== undefined) {
    try {
      const encoded = JSON.stringify(__nebulaReturned);
      __nebulaOutcome.returned = encoded === undefined ? null : encoded;
    } catch (__nebulaError) {
      __nebulaOutcome.serializationError = __nebulaDescribeError(__nebulaError).message;
    }
  }
  try {
    __nebulaOutcome.staticData = JSON.stringify(__nebulaStaticData);
  } catch (__nebulaError) {
    __nebulaOutcome.staticData = null;
  }
  return JSON.stringify(__nebulaOutcome);
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{ModuleKind, ModuleSource};
    use pretty_assertions::assert_eq;

    #[test]
    fn guest_offset_points_at_first_guest_line() {
        let script = assemble("return 1;\nreturn 2;", &ResolvedModules::default());
        let lines: Vec<&str> = script.text.lines().collect();
        let first = script.guest_line_offset as usize;
        assert_eq!(lines[first], "return 1;");
        assert_eq!(lines[first + 1], "return 2;");
    }

    #[test]
    fn allowed_modules_are_defined_and_configured() {
        let module = ModuleSource::new("greeter", ModuleKind::External, "module.exports = 1;");
        let resolved = ResolvedModules {
            known: ["greeter".to_owned(), "fs".to_owned()].into(),
            direct: ["greeter".to_owned()].into(),
            modules: vec![module],
        };
        let script = assemble("return [];", &resolved);
        assert!(script.text.contains("__nebulaModules.define(\"greeter\""));
        assert!(script.text.contains(r#"__nebulaModules.configure(["fs","greeter"], ["greeter"], ["greeter"]);"#));
    }
}
