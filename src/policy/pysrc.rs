//! Line and token level scanning of Python skill sources.
//!
//! A deliberately small surface: import statements, call references,
//! top-level class headers with their class-level assignments. Enough for
//! the policy scanner and the invariant checker; it does not follow
//! variables across assignments.

use once_cell::sync::Lazy;
use regex::Regex;

/// One import statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyImport {
    /// Imported module path (`a.b` for both `import a.b` and `from a.b import c`).
    pub module: String,
    /// Full dotted names pulled in (`a.b.c` for `from a.b import c`).
    pub names: Vec<String>,
    /// 1-based source line.
    pub line: usize,
}

/// A class-level assignment (`name = value` or `name: T = value`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyAssign {
    pub name: String,
    /// The literal text when the value is a plain string literal.
    pub string_value: Option<String>,
    pub line: usize,
}

/// A module-level class definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyClass {
    pub name: String,
    pub bases: Vec<String>,
    pub line: usize,
    pub assigns: Vec<PyAssign>,
}

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*import\s+(.+)$").expect("invalid import regex"));
static FROM_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*from\s+([A-Za-z_][\w.]*)\s+import\s+(.+)$").expect("invalid from-import regex")
});
static CLASS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^class\s+([A-Za-z_]\w*)\s*(?:\(([^)]*)\))?\s*:").expect("invalid class regex")
});
static ASSIGN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_]\w*)\s*(?::[^=]+)?=\s*(.+)$").expect("invalid assign regex")
});
static STRING_LITERAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^[rbf]?["']([^"']*)["']\s*(?:#.*)?$"#).expect("invalid string literal regex")
});

fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn indent_width(line: &str) -> usize {
    line.chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

/// Extract all import statements.
pub fn imports(source: &str) -> Vec<PyImport> {
    let mut out = Vec::new();
    for (idx, line) in source.lines().enumerate() {
        if is_comment_or_blank(line) {
            continue;
        }
        let lineno = idx + 1;
        if let Some(caps) = FROM_IMPORT_RE.captures(line) {
            let module = caps[1].to_string();
            let names = caps[2]
                .split(',')
                .map(|part| part.split_whitespace().next().unwrap_or("").trim())
                .filter(|name| !name.is_empty() && *name != "*")
                .map(|name| format!("{module}.{name}"))
                .collect();
            out.push(PyImport {
                module,
                names,
                line: lineno,
            });
        } else if let Some(caps) = IMPORT_RE.captures(line) {
            for part in caps[1].split(',') {
                let module = part
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if module.is_empty() {
                    continue;
                }
                out.push(PyImport {
                    module,
                    names: Vec::new(),
                    line: lineno,
                });
            }
        }
    }
    out
}

/// 1-based lines on which `callee(` is referenced.
///
/// Matches attribute paths too (`importlib.import_module`). Scans raw
/// text, so references inside strings or comments are reported as well;
/// the scanner is a denial gate, not a linter.
pub fn call_lines(source: &str, callee: &str) -> Vec<usize> {
    let pattern = format!(r"(?:^|[^\w.]){}\s*\(", regex::escape(callee));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    source
        .lines()
        .enumerate()
        .filter(|(_, line)| re.is_match(line))
        .map(|(idx, _)| idx + 1)
        .collect()
}

/// Extract module-level class definitions with their class-level
/// assignments (the first indentation level inside the class body).
pub fn classes(source: &str) -> Vec<PyClass> {
    let lines: Vec<&str> = source.lines().collect();
    let mut out = Vec::new();
    let mut idx = 0;

    while idx < lines.len() {
        let line = lines[idx];
        let Some(caps) = CLASS_RE.captures(line) else {
            idx += 1;
            continue;
        };

        let name = caps[1].to_string();
        let bases = caps
            .get(2)
            .map(|m| {
                m.as_str()
                    .split(',')
                    .map(|base| base.trim().rsplit('.').next().unwrap_or("").to_string())
                    .filter(|base| !base.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let class_line = idx + 1;
        let mut assigns = Vec::new();
        let mut body_indent: Option<usize> = None;

        idx += 1;
        while idx < lines.len() {
            let body_line = lines[idx];
            if is_comment_or_blank(body_line) {
                idx += 1;
                continue;
            }
            let indent = indent_width(body_line);
            if indent == 0 {
                break; // class body ended
            }
            let expected = *body_indent.get_or_insert(indent);
            if indent == expected {
                if let Some(assign) = ASSIGN_RE.captures(body_line.trim_start()) {
                    let value = assign[2].trim();
                    assigns.push(PyAssign {
                        name: assign[1].to_string(),
                        string_value: STRING_LITERAL_RE
                            .captures(value)
                            .map(|caps| caps[1].to_string()),
                        line: idx + 1,
                    });
                }
            }
            idx += 1;
        }

        out.push(PyClass {
            name,
            bases,
            line: class_line,
            assigns,
        });
    }

    out
}
