//! Assembly of the scripts the interpreter runs for one execution.
//!
//! Every execution runs two classic scripts in the same isolate:
//!
//! 1. the bootstrap, which captures the runtime ops in private closures,
//!    defines the context globals, attaches file accessors, installs the
//!    per-execution `console`, hides `Deno`, and binds the library constants
//! 2. the user program, a one-line wrapper handing the user's script to a
//!    one-shot settlement hook left behind by the bootstrap
//!
//! The user's script never shares a lexical scope with the ops. Only the
//! wrapper line precedes it, which is recorded as the program's line offset so
//! stack traces can be mapped back to the user's own line numbers.

use crate::error::SandboxError;
use scriptbox_common::{ExecutionRequest, FileReference};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Script name reported in stack frames of the user program
pub const PROGRAM_NAME: &str = "sbx:program";

/// Script name of the bootstrap that runs before the user program
pub const BOOTSTRAP_NAME: &str = "sbx:bootstrap";

/// Internal fields stripped from file nodes before the script sees them
pub const BOOKKEEPING_FIELDS: &[&str] = &["$fileId", "previewUrl"];

/// A library made available to every script as a `const` binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryBinding {
    /// Identifier the script uses
    pub name: String,
    /// JavaScript expression producing the library value
    pub source: String,
}

impl LibraryBinding {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// One installed file proxy: where it lives and what it reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProxySlot {
    pub tree_path: Vec<String>,
    pub location: String,
}

/// Explicit table from tree paths to proxy ids (the slot index)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileProxyTable {
    slots: Vec<FileProxySlot>,
}

impl FileProxyTable {
    pub fn slots(&self) -> &[FileProxySlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Locations in proxy-id order
    pub fn locations(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.location.clone()).collect()
    }

    /// `[[path, id], ...]` literal consumed by the generated install loop
    fn to_js_literal(&self) -> Result<String, SandboxError> {
        let entries: Vec<Value> = self
            .slots
            .iter()
            .enumerate()
            .map(|(id, slot)| serde_json::json!([slot.tree_path, id]))
            .collect();
        Ok(serde_json::to_string(&entries)?)
    }
}

/// The bootstrap and user program texts plus the coordinates of the user's
/// script in the program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxProgram {
    bootstrap: String,
    text: String,
    line_offset: usize,
    user_lines: usize,
}

impl SandboxProgram {
    /// Script run first, with access to the runtime ops
    pub fn bootstrap(&self) -> &str {
        &self.bootstrap
    }

    /// Script wrapping the user's code
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Lines preceding the first line of the user's script
    pub fn line_offset(&self) -> usize {
        self.line_offset
    }

    /// Number of lines of the user's script
    pub fn user_lines(&self) -> usize {
        self.user_lines
    }
}

/// Output of [`SandboxProgramBuilder::build`]
#[derive(Debug, Clone)]
pub struct BuiltProgram {
    pub program: SandboxProgram,
    /// Context globals with every file node replaced by its augmented copy
    pub globals: Map<String, Value>,
    pub files: FileProxyTable,
}

/// Builds [`SandboxProgram`]s for execution requests
#[derive(Debug, Clone, Default)]
pub struct SandboxProgramBuilder {
    libraries: Vec<LibraryBinding>,
}

impl SandboxProgramBuilder {
    pub fn new(libraries: Vec<LibraryBinding>) -> Self {
        Self { libraries }
    }

    pub fn build(&self, request: &ExecutionRequest) -> Result<BuiltProgram, SandboxError> {
        for name in request.context.globals.keys() {
            if UNDEFINABLE_GLOBALS.contains(&name.as_str()) {
                return Err(SandboxError::InvalidGlobal {
                    name: name.clone(),
                    reason: "the global object does not allow redefining it".to_string(),
                });
            }
        }

        let mut globals = request.context.globals.clone();
        let mut files = FileProxyTable::default();
        for reference in &request.files {
            let tree_path = install_file_node(&mut globals, reference)?;
            files.slots.push(FileProxySlot {
                tree_path,
                location: reference.location.clone(),
            });
        }

        let mut bootstrap = BOOTSTRAP.replace(FILES_PLACEHOLDER, &files.to_js_literal()?);
        for library in &self.libraries {
            if !is_identifier(&library.name) {
                return Err(SandboxError::Bootstrap(format!(
                    "library name `{}` is not a valid identifier",
                    library.name
                )));
            }
            bootstrap.push_str(&format!("const {} = ({});\n", library.name, library.source));
        }

        let line_offset = line_breaks(USER_HEAD);
        let user_lines = line_count(&request.code);

        let mut text = String::from(USER_HEAD);
        text.push_str(&request.code);
        text.push('\n');
        text.push_str(USER_TAIL);

        Ok(BuiltProgram {
            program: SandboxProgram {
                bootstrap,
                text,
                line_offset,
                user_lines,
            },
            globals,
            files,
        })
    }
}

/// Non-writable properties of the global object, plus `__proto__`
const UNDEFINABLE_GLOBALS: &[&str] = &["__proto__", "undefined", "NaN", "Infinity"];

const FILES_PLACEHOLDER: &str = "__SBX_FILES__";

// Runs with the ops in scope. The user program can only reach the globals,
// `console`, the file accessors and `__sbxRun`, which deletes itself on first
// use. A console argument whose JSON serialization throws or yields nothing
// is logged in its String() form.
const BOOTSTRAP: &str = r#"((ops) => {
  const { stringify } = JSON;
  const toText = String;
  const { apply } = Reflect;
  const { defineProperty, keys, freeze } = Object;
  const objectTag = Object.prototype.toString;
  const describe = (e) => { try { return e && e.stack ? toText(e.stack) : toText(e); } catch (_) { return "Uncaught exception"; } };
  const setOutput = (json) => ops.op_sbx_set_output(json);
  const setError = (stack) => ops.op_sbx_set_error(stack);
  const log = (level, message) => ops.op_sbx_log(level, message);
  const readFile = (id, mode) => ops.op_sbx_read_file(id, mode);
  const readFileAsync = (id, mode) => ops.op_sbx_read_file_async(id, mode);
  const define = (name, value, enumerable) =>
    defineProperty(globalThis, name, { value, writable: true, enumerable, configurable: true });

  const globals = ops.op_sbx_globals();
  for (const name of keys(globals)) define(name, globals[name], true);

  const modeOf = (mode) => (mode == null ? "" : toText(mode));
  for (const [path, id] of __SBX_FILES__) {
    const node = path.reduce((parent, key) => parent[key], globalThis);
    node.readContents = (mode) => readFile(id, modeOf(mode));
    node.readContentsAsync = async (mode) => readFileAsync(id, modeOf(mode));
  }

  const raw = (arg) => { try { return toText(arg); } catch (_) { return apply(objectTag, arg, []); } };
  const render = (args) => args.map((arg) => {
    try {
      const json = stringify(arg, null, 2);
      return json === undefined ? raw(arg) : json;
    } catch (_) {
      return raw(arg);
    }
  }).join("\n");
  const sink = (level) => (...args) => { log(level, render(args)); };
  define("console", freeze({
    log: sink("info"), info: sink("info"), debug: sink("info"), dir: sink("info"),
    warn: sink("warn"), error: sink("error"),
  }), false);

  let started = false;
  defineProperty(globalThis, "__sbxRun", {
    configurable: true,
    value: (body) => {
      delete globalThis.__sbxRun;
      if (started) throw new Error("execution already started");
      started = true;
      return (async () => {
        try {
          const result = await body();
          setOutput(result === undefined ? "null" : (stringify(result) ?? "null"));
        } catch (e) {
          setError(describe(e));
        }
      })();
    },
  });

  delete globalThis.Deno;
  delete globalThis.__bootstrap;
})(Deno.core.ops);
"#;

const USER_HEAD: &str = "__sbxRun(async () => {\n";

const USER_TAIL: &str = "});\n";

/// Line terminators as the interpreter counts them: `\n`, `\r\n`, a lone
/// `\r`, U+2028 and U+2029
fn line_breaks(text: &str) -> usize {
    let mut breaks = 0;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                chars.next_if_eq(&'\n');
                breaks += 1;
            }
            '\n' | '\u{2028}' | '\u{2029}' => breaks += 1,
            _ => {}
        }
    }
    breaks
}

/// Lines of `code`, not counting a trailing terminator; at least one
fn line_count(code: &str) -> usize {
    let ends_with_break = code.ends_with(['\n', '\r', '\u{2028}', '\u{2029}']);
    (line_breaks(code) + usize::from(!ends_with_break)).max(1)
}

/// Words that cannot name a top-level `const` binding, in sloppy or strict code
const RESERVED_WORDS: &[&str] = &[
    "Infinity", "NaN", "undefined", "arguments", "await", "break", "case", "catch", "class", "const", "continue", "debugger",
    "default", "delete", "do", "else", "enum", "eval", "export", "extends", "false", "finally",
    "for", "function", "if", "implements", "import", "in", "instanceof", "interface", "let",
    "new", "null", "package", "private", "protected", "public", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Check that `name` can be used as a JavaScript binding name
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') && !RESERVED_WORDS.contains(&name)
}

fn invalid_path(path: &str, reason: impl Into<String>) -> SandboxError {
    SandboxError::InvalidTreePath {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Locate (or create) the node at the reference's tree path and replace it with
/// a copy stripped of bookkeeping fields. Returns the parsed path.
fn install_file_node(
    globals: &mut Map<String, Value>,
    reference: &FileReference,
) -> Result<Vec<String>, SandboxError> {
    let path = &reference.tree_path;
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(invalid_path(path, "empty path segment"));
    }

    let (first, rest) = segments
        .split_first()
        .ok_or_else(|| invalid_path(path, "empty path"))?;
    let mut node = globals.entry(first.clone()).or_insert(Value::Null);
    for segment in rest {
        node = child_mut(node, segment, path)?;
    }

    *node = match &*node {
        Value::Null => Value::Object(Map::new()),
        Value::Object(fields) => {
            let mut copy = fields.clone();
            for field in BOOKKEEPING_FIELDS {
                copy.remove(*field);
            }
            Value::Object(copy)
        }
        _ => return Err(invalid_path(path, "file node must be an object")),
    };

    Ok(segments)
}

fn child_mut<'v>(node: &'v mut Value, segment: &str, path: &str) -> Result<&'v mut Value, SandboxError> {
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(fields) => Ok(fields.entry(segment.to_string()).or_insert(Value::Null)),
        Value::Array(items) => {
            let index: usize = segment
                .parse()
                .map_err(|_| invalid_path(path, format!("`{}` is not an array index", segment)))?;
            if index > items.len() {
                return Err(invalid_path(path, format!("index {} is out of bounds", index)));
            }
            if index == items.len() {
                items.push(Value::Null);
            }
            Ok(&mut items[index])
        }
        _ => Err(invalid_path(
            path,
            format!("`{}` does not address an object or array", segment),
        )),
    }
}
