//! Display-name derivation for records, methods and statics.

use crate::error::{Result, TranslateError};
use std::collections::{BTreeMap, HashSet};

const RESERVED: &[&str] = &["class", "struct", "union", "namespace", "public", "static", "void"];

pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.contains(&name)
}

/// Replaces every character that cannot appear in an identifier with `_`.
/// Falls back to `fallback` when nothing usable is left.
pub fn clean_name(name: &str, fallback: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.chars().all(|c| c == '_') {
        return fallback.to_string();
    }
    if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        cleaned.insert(0, '_');
    }
    if RESERVED.contains(&cleaned.as_str()) {
        cleaned.insert(0, '_');
    }
    cleaned
}

/// Strips the `class.`/`struct.`/`union.` tag a frontend puts on aggregate names.
pub fn strip_aggregate_tag(mangled: &str) -> &str {
    for tag in ["class.", "struct.", "union."] {
        if let Some(rest) = mangled.strip_prefix(tag) {
            return rest;
        }
    }
    mangled
}

/// Hands out names unique within one scope by suffixing `_<n>`.
#[derive(Debug, Default)]
pub struct NameScope {
    taken: HashSet<String>,
}

impl NameScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, base: &str) -> String {
        if self.taken.insert(base.to_string()) {
            return base.to_string();
        }
        let mut index = 1;
        loop {
            let candidate = format!("{}_{}", base, index);
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            index += 1;
        }
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.taken.contains(name)
    }
}

/// Pieces of a demangled signature such as `public: void * __cdecl Foo::bar(int)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemangledFunction {
    pub return_type: Option<String>,
    pub type_name: Option<String>,
    pub function_name: String,
    /// Qualified name, e.g. `Foo::bar`.
    pub identifier: String,
}

const DECORATIONS: &[&str] = &[
    "public:",
    "private:",
    "protected:",
    "static",
    "virtual",
    "__cdecl",
    "__stdcall",
    "__thiscall",
    "__fastcall",
    "__vectorcall",
    "__clrcall",
    "__ptr64",
];

pub fn parse_demangled(text: &str) -> Option<DemangledFunction> {
    let open = find_argument_list(text)?;
    let head = text[..open].trim_end();

    // the qualified name is the last top-level token; `quoted names' may contain spaces
    let name_start = if head.ends_with('\'') {
        let quote = head.rfind('`')?;
        head[..quote].rfind(' ').map(|i| i + 1).unwrap_or(0)
    } else {
        last_top_level_space(head).map(|i| i + 1).unwrap_or(0)
    };
    let identifier = head[name_start..].trim().to_string();
    if identifier.is_empty() {
        return None;
    }

    let return_type = head[..name_start]
        .split_whitespace()
        .filter(|token| !DECORATIONS.contains(token))
        .collect::<Vec<_>>()
        .join(" ");
    let return_type = (!return_type.is_empty()).then_some(return_type);

    let (type_name, function_name) = match split_last_scope(&identifier) {
        Some((scope, name)) => (Some(scope.to_string()), name.to_string()),
        None => (None, identifier.clone()),
    };

    Some(DemangledFunction {
        return_type,
        type_name,
        function_name,
        identifier,
    })
}

fn find_argument_list(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut quoted = false;
    for (index, c) in text.char_indices() {
        match c {
            '`' => quoted = true,
            '\'' => quoted = false,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth -= 1,
            '(' if !quoted && depth == 0 => {
                // `operator()` names its own parentheses
                if text[..index].ends_with("operator") {
                    continue;
                }
                return Some(index);
            }
            _ => {}
        }
    }
    None
}

fn last_top_level_space(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut found = None;
    for (index, c) in text.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth -= 1,
            ' ' if depth == 0 => found = Some(index),
            _ => {}
        }
    }
    found
}

fn split_last_scope(identifier: &str) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    let mut split = None;
    let bytes = identifier.as_bytes();
    for index in 0..bytes.len() {
        match bytes[index] {
            b'<' => depth += 1,
            b'>' => depth -= 1,
            b'`' => break,
            b':' if depth == 0 && bytes.get(index + 1) == Some(&b':') => split = Some(index),
            _ => {}
        }
    }
    split.map(|index| (&identifier[..index], &identifier[index + 2..]))
}

/// Simple name embedded in an MSVC mangled symbol: `?name@...` or `??$name@...`.
pub fn simple_mangled_name(mangled: &str) -> &str {
    if !mangled.starts_with('?') {
        return mangled;
    }
    let start = if mangled.starts_with("??$") { 3 } else { 1 };
    match mangled[start..].find('@') {
        Some(end) => &mangled[start..start + end],
        None => &mangled[start..],
    }
}

/// Derives a method display name from the symbol, its demangled form and the override map.
pub fn function_display_name(
    mangled: &str,
    demangled: Option<&str>,
    renamed: &BTreeMap<String, String>,
) -> Result<String> {
    if let Some(name) = renamed.get(mangled) {
        if !is_valid_identifier(name) {
            return Err(TranslateError::Config(format!(
                "renamed symbol '{}' has an invalid name '{}'",
                mangled, name
            )));
        }
        return Ok(name.clone());
    }

    let parsed = demangled
        .filter(|text| !text.is_empty() && *text != mangled)
        .and_then(parse_demangled);
    let Some(parsed) = parsed else {
        return Ok(clean_name(simple_mangled_name(mangled), "Function"));
    };

    let type_name = parsed.type_name.as_deref().unwrap_or("");
    let last_type_segment = split_last_scope(type_name)
        .map(|(_, last)| last)
        .unwrap_or(type_name);
    let name = if parsed.return_type.is_none()
        && !type_name.is_empty()
        && parsed.function_name == last_type_segment
    {
        format!("{}_Constructor", clean_name(type_name, "Type"))
    } else if parsed.return_type.is_none()
        && parsed.function_name == format!("~{}", last_type_segment)
    {
        format!("{}_Destructor", clean_name(type_name, "Type"))
    } else if parsed.return_type.as_deref() == Some("void *")
        && parsed.function_name == "`scalar deleting dtor'"
    {
        format!("{}_Delete", clean_name(type_name, "Type"))
    } else {
        clean_name(&parsed.identifier, "Function")
    };
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_valid_identifier("Foo_1"));
        assert!(is_valid_identifier("_x"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1x"));
        assert!(!is_valid_identifier("a b"));
        assert!(!is_valid_identifier("struct"));
    }

    #[test]
    fn clean_name_replaces_and_falls_back() {
        assert_eq!(clean_name("Foo::bar", "Function"), "Foo__bar");
        assert_eq!(clean_name("", "Struct"), "Struct");
        assert_eq!(clean_name("...", "Struct"), "Struct");
        assert_eq!(clean_name("3d", "Struct"), "_3d");
    }

    #[test]
    fn aggregate_tags_are_stripped() {
        assert_eq!(strip_aggregate_tag("class.Foo"), "Foo");
        assert_eq!(strip_aggregate_tag("struct.Bar"), "Bar");
        assert_eq!(strip_aggregate_tag("union.U"), "U");
        assert_eq!(strip_aggregate_tag("Plain"), "Plain");
    }

    #[test]
    fn scope_suffixes_duplicates() {
        let mut scope = NameScope::new();
        assert_eq!(scope.claim("Foo"), "Foo");
        assert_eq!(scope.claim("Foo"), "Foo_1");
        assert_eq!(scope.claim("Foo"), "Foo_2");
        assert!(scope.is_taken("Foo_1"));
    }

    #[test]
    fn msvc_simple_names() {
        assert_eq!(simple_mangled_name("?compute@@YAHH@Z"), "compute");
        assert_eq!(simple_mangled_name("??$max@H@@YAHHH@Z"), "max");
        assert_eq!(simple_mangled_name("main"), "main");
    }

    #[test]
    fn demangled_constructor_destructor_and_delete() {
        let none = BTreeMap::new();
        assert_eq!(
            function_display_name(
                "??0Widget@@QEAA@XZ",
                Some("public: __cdecl Widget::Widget(void) __ptr64"),
                &none
            )
            .unwrap(),
            "Widget_Constructor"
        );
        assert_eq!(
            function_display_name(
                "??1Widget@@QEAA@XZ",
                Some("public: __cdecl Widget::~Widget(void) __ptr64"),
                &none
            )
            .unwrap(),
            "Widget_Destructor"
        );
        assert_eq!(
            function_display_name(
                "??_GWidget@@QEAAPEAXI@Z",
                Some("public: void * __ptr64 __cdecl Widget::`scalar deleting dtor'(unsigned int) __ptr64"),
                &none
            )
            .unwrap(),
            "Widget_Delete"
        );
        assert_eq!(
            function_display_name(
                "?area@Shape@@QEBAHXZ",
                Some("public: int __cdecl Shape::area(void) const __ptr64"),
                &none
            )
            .unwrap(),
            "Shape__area"
        );
    }

    #[test]
    fn override_wins_and_is_validated() {
        let mut renamed = BTreeMap::new();
        renamed.insert("?f@@YAXXZ".to_string(), "Renamed".to_string());
        renamed.insert("?g@@YAXXZ".to_string(), "bad name".to_string());
        assert_eq!(
            function_display_name("?f@@YAXXZ", None, &renamed).unwrap(),
            "Renamed"
        );
        assert!(function_display_name("?g@@YAXXZ", None, &renamed).is_err());
        assert_eq!(
            function_display_name("?h@@YAXXZ", None, &renamed).unwrap(),
            "h"
        );
    }
}
